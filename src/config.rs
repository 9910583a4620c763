lazy_static::lazy_static! {
    pub static ref CONFIG: Config = Config::from_env();
}

#[derive(Clone, Debug)]
pub struct Config {
    /// `RTG_TRACE_EVAL`: log every instruction as it is evaluated.
    pub trace_eval: bool,
    /// `RTG_TRACE_COMPILE`: log the whole program after each pass.
    pub trace_compile: bool,
    /// `RTG_OFFLOAD_COPY`: default for `GpuTarget::offload_copy`.
    pub offload_copy: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trace_eval: false,
            trace_compile: false,
            offload_copy: true,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            trace_eval: getenv("RTG_TRACE_EVAL", default.trace_eval),
            trace_compile: getenv("RTG_TRACE_COMPILE", default.trace_compile),
            offload_copy: getenv("RTG_OFFLOAD_COPY", default.offload_copy),
        }
    }
}

pub trait EnvValue: Sized {
    fn parse_env(s: &str) -> Option<Self>;
}

impl EnvValue for bool {
    fn parse_env(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" | "" => Some(false),
            _ => None,
        }
    }
}

impl EnvValue for usize {
    fn parse_env(s: &str) -> Option<Self> {
        s.trim().parse().ok()
    }
}

/// Reads `name` from the environment, falling back to `default` when it is unset
/// or does not parse.
pub fn getenv<T: EnvValue>(name: &str, default: T) -> T {
    std::env::var(name.to_uppercase())
        .ok()
        .and_then(|v| T::parse_env(&v))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bool_flags() {
        assert_eq!(bool::parse_env("ON"), Some(true));
        assert_eq!(bool::parse_env(" 0 "), Some(false));
        assert_eq!(bool::parse_env("maybe"), None);
        assert!(getenv("RTG_SURELY_UNSET_FLAG", true));
        assert_eq!(getenv("RTG_SURELY_UNSET_COUNT", 7usize), 7);
    }
}
