use thiserror::Error;

use crate::config::ConfigError;

/// Errors raised by the fan-out engine facade.
///
/// Tick admission never fails with an error: a rejected tick is a `false`
/// return from `queue_tick`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("failed to spawn worker for shard {shard}: {source}")]
    WorkerSpawn {
        shard: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("engine already shut down")]
    AlreadyShutDown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_converts() {
        let config_error = ConfigError::Invalid {
            field: "shard_count",
            reason: "must be at least 1".to_string(),
        };
        let error: EngineError = config_error.into();
        assert!(matches!(error, EngineError::InvalidConfig(_)));
        assert_eq!(
            error.to_string(),
            "invalid configuration: invalid config value for shard_count: must be at least 1"
        );
    }

    #[test]
    fn test_spawn_error_names_shard() {
        let error = EngineError::WorkerSpawn {
            shard: 2,
            source: std::io::Error::new(std::io::ErrorKind::Other, "no threads"),
        };
        assert!(error.to_string().contains("shard 2"));
    }
}
