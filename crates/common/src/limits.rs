use serde::Serialize;

/// Where an effective setting came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitSource {
    Env,
    Config,
    Default,
}

pub fn parse_env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse::<u64>().ok()
}

pub fn parse_env_bool(name: &str) -> Option<bool> {
    let v = std::env::var(name).ok()?;
    match v.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn clamp(v: u64, min: u64, max: u64) -> u64 {
    if v < min {
        return min;
    }
    if v > max {
        return max;
    }
    v
}

/// Resolve a duration in seconds: env → config → default, clamped to `[min..max]`.
pub fn resolve_secs(
    env_name: &str,
    configured: Option<u64>,
    default: u64,
    min: u64,
    max: u64,
) -> (u64, LimitSource) {
    if let Some(envv) = parse_env_u64(env_name) {
        (clamp(envv, min, max), LimitSource::Env)
    } else if let Some(value) = configured {
        (clamp(value, min, max), LimitSource::Config)
    } else {
        (clamp(default, min, max), LimitSource::Default)
    }
}
