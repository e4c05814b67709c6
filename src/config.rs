use clap::Args;

use crate::access::{Actor, Role};

/// Connection and job settings shared by every command.
#[derive(Debug, Clone, Args)]
pub struct Settings {
    /// Postgres connection URL.
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: String,

    #[arg(long, env = "DISMISSAL_MAX_CONNECTIONS", default_value_t = 5)]
    pub max_connections: u32,

    /// How many cars each top-arrivals list keeps.
    #[arg(long, env = "DISMISSAL_TOP_ARRIVALS", default_value_t = 10)]
    pub top_arrivals: usize,

    /// Tracing filter, e.g. `info` or `dismissal_queue=debug`.
    #[arg(long, env = "DISMISSAL_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Who the CLI acts as. Stands in for the identity provider.
#[derive(Debug, Clone, Args)]
pub struct ActorArgs {
    #[arg(long, env = "DISMISSAL_ROLE", default_value = "viewer")]
    pub role: Role,

    /// Restrict the actor to one campus.
    #[arg(long, env = "DISMISSAL_CAMPUS_SCOPE")]
    pub campus_scope: Option<String>,
}

impl ActorArgs {
    pub fn actor(&self) -> Actor {
        Actor::new(self.role, self.campus_scope.clone())
    }
}
