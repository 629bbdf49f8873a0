use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "boltcard-gateway")]
#[command(about = "Custodial Bolt Card gateway backed by a Phoenix Lightning node")]
#[command(version)]
pub struct Config {
    /// Host address to bind to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "8080")]
    pub port: u16,

    /// Public domain for LNURLw URLs (e.g., "cards.example.com")
    #[arg(long, env = "HOST_DOMAIN")]
    pub domain: String,

    /// SQLite database URL
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://cards.db?mode=rwc")]
    pub database_url: String,

    /// Smallest withdrawal advertised to wallets, in sats
    #[arg(long, env = "MIN_WITHDRAW_SATS", default_value = "1")]
    pub min_withdraw_sats: u64,

    /// Largest withdrawal advertised to wallets, in sats. A callback for
    /// exactly this amount is treated as a sweep and refused.
    #[arg(long, env = "MAX_WITHDRAW_SATS", default_value = "1000000")]
    pub max_withdraw_sats: u64,

    /// Lifetime of a withdraw k1 challenge
    #[arg(long, env = "K1_EXPIRY_SECS", default_value = "10")]
    pub k1_expiry_secs: i64,

    /// Secret required by /new to issue a card; issuance is off when unset
    #[arg(long, env = "NEW_CARD_CODE")]
    pub new_card_code: Option<String>,

    /// Serve the LndHub-style wallet API
    #[arg(long, env = "WALLET_API", default_value_t = true, action = ArgAction::Set)]
    pub wallet_api: bool,

    /// Secret a wallet must send to /create; account creation is off when unset
    #[arg(long, env = "INVITE_SECRET")]
    pub invite_secret: Option<String>,

    /// Phoenix HTTP API base URL
    #[arg(long, env = "PHOENIX_URL", default_value = "http://phoenix:9740")]
    pub phoenix_url: String,

    /// Phoenix config file holding `http-password`
    #[arg(long, env = "PHOENIX_CONFIG", default_value = "/root/.phoenix/phoenix.conf")]
    pub phoenix_config: PathBuf,

    /// Timeout for payment submission
    #[arg(long, env = "PAY_TIMEOUT_SECS", default_value = "30")]
    pub pay_timeout_secs: u64,

    /// Timeout for lookups and invoice creation
    #[arg(long, env = "LOOKUP_TIMEOUT_SECS", default_value = "5")]
    pub lookup_timeout_secs: u64,
}

impl Config {
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn lnurlw_base(&self) -> String {
        format!("lnurlw://{}/ln", self.domain)
    }

    pub fn callback_url(&self) -> String {
        format!("https://{}/cb", self.domain)
    }
}

#[cfg(test)]
impl Config {
    pub fn for_tests() -> Self {
        Self::parse_from(["boltcard-gateway", "--domain", "cards.test"])
    }
}
