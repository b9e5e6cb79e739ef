//! Well-known experiment names.

/// Runs the build through the agent executable.
pub const AGENT: &str = "kiln.agent";
/// Uses canary versions of infrastructure software.
pub const CANARY_SOFTWARE: &str = "kiln.canary_software";
/// Marks the build as non-production (lowest priority, hidden from search).
pub const NON_PRODUCTION: &str = "kiln.non_production";
pub const USE_REALMS: &str = "kiln.use_realms";

/// Experiments with this prefix must be well-known.
pub const RESERVED_PREFIX: &str = "kiln.";

pub const WELL_KNOWN: &[&str] = &[AGENT, CANARY_SOFTWARE, NON_PRODUCTION, USE_REALMS];

pub fn is_well_known(name: &str) -> bool {
    WELL_KNOWN.contains(&name)
}
