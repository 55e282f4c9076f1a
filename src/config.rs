use std::env;

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub token_type: String,
    pub script_hash: String,
    pub min_tx_amount: u128,
    pub max_tx_amount: u128,
    pub max_request_amount: u128,
    pub max_pool_balance: u128,
    /// Service fee rate expressed in basis points (1/10_000).
    pub service_fee_bps: u32,
}

impl TokenConfig {
    pub fn service_fee(&self, total_amount: u128) -> u128 {
        // ceil(total * fee_bps / 10_000)
        let numerator = total_amount * self.service_fee_bps as u128;
        numerator.div_ceil(10_000)
    }
}

#[derive(Debug, Clone)]
pub struct MixerConfig {
    // Server
    pub host: String,
    pub port: u16,

    // Accounts service
    pub accounts_base_url: String,
    pub service_id: String,
    pub strict_identity: bool,
    pub mtls_cert_path: Option<String>,
    pub mtls_key_path: Option<String>,

    // On-chain fulfiller
    pub fulfiller_base_url: String,

    // Fee collection
    pub fee_address: String,

    // Mixing defaults
    pub default_mixing_duration_secs: u64,
    pub dispute_grace_period_secs: u64,

    // Token policy
    pub tokens: Vec<TokenConfig>,

    // Redis (optional)
    pub redis_url: Option<String>,

    // Rate limiting
    pub rate_limit_per_min: u32,

    // CORS
    pub allowed_origins: Vec<String>,
}

impl MixerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let accounts_base_url = require_env("ACCOUNTS_BASE_URL")?;
        validate_url(&accounts_base_url, "ACCOUNTS_BASE_URL")?;

        let service_id = require_env("MIXER_SERVICE_ID")?;
        let fulfiller_base_url = require_env("FULFILLER_BASE_URL")?;
        validate_url(&fulfiller_base_url, "FULFILLER_BASE_URL")?;

        let fee_address = require_env("MIXER_FEE_ADDRESS")?;

        let strict_identity: bool = parse_env_or("MIXER_STRICT_IDENTITY", true)?;
        let mtls_cert_path = env::var("MIXER_MTLS_CERT_PATH").ok().filter(|s| !s.is_empty());
        let mtls_key_path = env::var("MIXER_MTLS_KEY_PATH").ok().filter(|s| !s.is_empty());
        if strict_identity && (mtls_cert_path.is_none() || mtls_key_path.is_none()) {
            return Err(ConfigError::Invalid(
                "MIXER_STRICT_IDENTITY".into(),
                "strict identity mode requires MIXER_MTLS_CERT_PATH and MIXER_MTLS_KEY_PATH".into(),
            ));
        }

        let redis_url = env::var("REDIS_URL").ok().filter(|s| !s.is_empty());

        let allowed_origins = env::var("MIXER_ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        let default_mixing_duration_secs: u64 =
            parse_env_or("MIXER_DEFAULT_MIXING_DURATION_SECS", 1800)?;
        if default_mixing_duration_secs == 0 {
            return Err(ConfigError::Invalid(
                "MIXER_DEFAULT_MIXING_DURATION_SECS".into(),
                "must be > 0".into(),
            ));
        }
        let dispute_grace_period_secs: u64 =
            parse_env_or("MIXER_DISPUTE_GRACE_PERIOD_SECS", 7 * 86_400)?;
        if dispute_grace_period_secs == 0 {
            return Err(ConfigError::Invalid(
                "MIXER_DISPUTE_GRACE_PERIOD_SECS".into(),
                "must be > 0".into(),
            ));
        }
        let rate_limit_per_min: u32 = parse_env_or("MIXER_RATE_LIMIT", 30)?;
        if rate_limit_per_min == 0 {
            return Err(ConfigError::Invalid("MIXER_RATE_LIMIT".into(), "must be > 0".into()));
        }

        Ok(Self {
            host: env::var("MIXER_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env::var("MIXER_PORT")
                .unwrap_or_else(|_| "8080".into())
                .parse()
                .map_err(|_| ConfigError::Invalid("MIXER_PORT".into(), "must be a valid port number".into()))?,
            accounts_base_url,
            service_id,
            strict_identity,
            mtls_cert_path,
            mtls_key_path,
            fulfiller_base_url,
            fee_address,
            default_mixing_duration_secs,
            dispute_grace_period_secs,
            tokens: default_token_configs(),
            redis_url,
            rate_limit_per_min,
            allowed_origins,
        })
    }

    pub fn token(&self, token_type: &str) -> Option<&TokenConfig> {
        self.tokens.iter().find(|t| t.token_type == token_type)
    }
}

/// Built-in NEP-17 token policy. Process-wide and read-mostly; a
/// configuration reload replaces this vector atomically (spec §9).
fn default_token_configs() -> Vec<TokenConfig> {
    vec![
        TokenConfig {
            token_type: "GAS".into(),
            script_hash: "0xd2a4cff31913016155e38e474a2c06d08be276cf".into(),
            min_tx_amount: 1_000,
            max_tx_amount: 1_000_000_000_000,
            max_request_amount: 100_000_000_000_000,
            max_pool_balance: 1_000_000_000_000_000,
            service_fee_bps: 50,
        },
        TokenConfig {
            token_type: "NEO".into(),
            script_hash: "0xef4073a0f2b305a38ec4050e4d3d28bc40ea63f5".into(),
            min_tx_amount: 1,
            max_tx_amount: 1_000_000,
            max_request_amount: 10_000_000,
            max_pool_balance: 100_000_000,
            service_fee_bps: 50,
        },
    ]
}

/// Constant-time address comparison, used wherever an address is checked
/// against a configured secret-adjacent value (the fee address) rather
/// than another user-supplied one.
pub fn addresses_match(a: &str, b: &str) -> bool {
    use subtle::ConstantTimeEq;
    a.len() == b.len() && a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn require_env(name: &str) -> Result<String, ConfigError> {
    env::var(name)
        .map_err(|_| ConfigError::Missing(name.into()))
        .and_then(|v| {
            if v.is_empty() {
                Err(ConfigError::Missing(name.into()))
            } else {
                Ok(v)
            }
        })
}

fn parse_env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(v) if !v.is_empty() => v
            .parse()
            .map_err(|_| ConfigError::Invalid(name.into(), format!("could not parse '{v}'"))),
        _ => Ok(default),
    }
}

fn validate_url(url: &str, name: &str) -> Result<(), ConfigError> {
    let lower = url.to_lowercase();
    if lower.starts_with("https://") {
        return Ok(());
    }
    if lower.starts_with("http://") {
        let host_part = lower.trim_start_matches("http://");
        if host_part.starts_with("localhost")
            || host_part.starts_with("127.0.0.1")
            || host_part.starts_with("[::1]")
        {
            return Ok(());
        }
        return Err(ConfigError::Invalid(
            name.into(),
            "must use HTTPS for non-localhost URLs".into(),
        ));
    }
    Err(ConfigError::Invalid(
        name.into(),
        "must start with https:// (or http:// for localhost)".into(),
    ))
}

#[derive(Debug)]
pub enum ConfigError {
    Missing(String),
    Invalid(String, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing(name) => write!(f, "missing required env var: {name}"),
            ConfigError::Invalid(name, reason) => {
                write!(f, "invalid env var {name}: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_is_ceiling_division() {
        let cfg = TokenConfig {
            token_type: "GAS".into(),
            script_hash: "0x0".into(),
            min_tx_amount: 1,
            max_tx_amount: 1_000_000,
            max_request_amount: 1_000_000,
            max_pool_balance: 1_000_000,
            service_fee_bps: 50,
        };
        // 0.5% of 1_000_000 = 5_000 exactly.
        assert_eq!(cfg.service_fee(1_000_000), 5_000);
        // 0.5% of 1_000_001 rounds up.
        assert_eq!(cfg.service_fee(1_000_001), 5_001);
    }

    #[test]
    fn addresses_match_is_constant_time_equal() {
        assert!(addresses_match("NABC123", "NABC123"));
        assert!(!addresses_match("NABC123", "NABC124"));
        assert!(!addresses_match("NABC123", "NABC12"));
    }
}
