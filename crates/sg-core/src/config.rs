use anyhow::{anyhow, Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

pub fn required_env(name: &str) -> Result<String> {
    env::var(name).with_context(|| format!("missing env: {name}"))
}

pub fn optional_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

pub fn env_or(name: &str, default: &str) -> String {
    optional_env(name).unwrap_or_else(|| default.to_string())
}

pub fn u64_from_env(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

pub fn socket_addr_from_env(name: &str, default: &str) -> Result<SocketAddr> {
    let value = env::var(name).unwrap_or_else(|_| default.to_string());
    SocketAddr::from_str(&value).map_err(|err| anyhow!("invalid socket addr for {name}: {err}"))
}

pub fn dir_from_env(name: &str, default: &str) -> Result<PathBuf> {
    let path = PathBuf::from(env_or(name, default));
    if path.as_os_str().is_empty() {
        return Err(anyhow!("{name} resolved to an empty path"));
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EnvGuard {
        key: &'static str,
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            env::remove_var(self.key);
        }
    }

    fn set_env(key: &'static str, value: &str) -> EnvGuard {
        env::set_var(key, value);
        EnvGuard { key }
    }

    #[test]
    fn required_env_reads_value() {
        let _guard = set_env("SG_TEST_REQUIRED_ENV_PRESENT", "value");
        let value = required_env("SG_TEST_REQUIRED_ENV_PRESENT").unwrap();
        assert_eq!(value, "value");
    }

    #[test]
    fn required_env_missing_returns_error() {
        env::remove_var("SG_TEST_REQUIRED_ENV_MISSING");
        assert!(required_env("SG_TEST_REQUIRED_ENV_MISSING").is_err());
    }

    #[test]
    fn optional_env_treats_blank_as_missing() {
        let _guard = set_env("SG_TEST_OPTIONAL_BLANK", "   ");
        assert_eq!(optional_env("SG_TEST_OPTIONAL_BLANK"), None);
        assert_eq!(env_or("SG_TEST_OPTIONAL_BLANK", "fallback"), "fallback");
    }

    #[test]
    fn u64_from_env_ignores_garbage() {
        let _guard = set_env("SG_TEST_U64_GARBAGE", "ten");
        assert_eq!(u64_from_env("SG_TEST_U64_GARBAGE", 10), 10);
    }

    #[test]
    fn u64_from_env_parses_override() {
        let _guard = set_env("SG_TEST_U64_OVERRIDE", "42");
        assert_eq!(u64_from_env("SG_TEST_U64_OVERRIDE", 10), 42);
    }

    #[test]
    fn socket_addr_from_env_uses_default() {
        env::remove_var("SG_TEST_SOCKET_DEFAULT");
        let addr = socket_addr_from_env("SG_TEST_SOCKET_DEFAULT", "127.0.0.1:1234").unwrap();
        assert_eq!(addr, "127.0.0.1:1234".parse().unwrap());
    }

    #[test]
    fn socket_addr_from_env_invalid_returns_error() {
        let _guard = set_env("SG_TEST_SOCKET_INVALID", "not-a-socket");
        assert!(socket_addr_from_env("SG_TEST_SOCKET_INVALID", "127.0.0.1:1234").is_err());
    }
}
