use rhubarb_proto::ServerAddr;
use serde::Deserialize;

use super::builder::{Auth, ClientBuilder};

/// Configuration read from `RHUBARB_*` environment variables
#[derive(Debug, Deserialize)]
pub(crate) struct FromEnv {
    pub(crate) url: Option<ServerAddr>,
    pub(crate) username: Option<String>,
    pub(crate) password: Option<String>,
    pub(crate) token: Option<String>,
}

impl ClientBuilder {
    /// Construct a [`ClientBuilder`] from environment variables
    ///
    /// * `RHUBARB_URL`: the server URL
    /// * `RHUBARB_USERNAME` and `RHUBARB_PASSWORD`: username/password
    ///   authentication
    /// * `RHUBARB_TOKEN`: token authentication
    ///
    /// # Panics
    ///
    /// It panics if the environment variables cannot be read or parsed.
    #[must_use]
    pub fn from_env() -> Self {
        let env = envy::prefixed("RHUBARB_")
            .from_env::<FromEnv>()
            .expect("FromEnv deserialization error");

        let mut this = Self::new();
        if let Some(url) = env.url {
            this = this.url(url);
        }

        match (env.username, env.password, env.token) {
            (Some(username), Some(password), _) => {
                this = this.auth(Auth::UserAndPassword { username, password });
            }
            (_, _, Some(token)) => {
                this = this.auth(Auth::Token(token));
            }
            _ => {}
        }

        this
    }
}
