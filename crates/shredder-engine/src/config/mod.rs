pub mod parser;
pub mod types;
pub mod validator;

pub use parser::{parse_targets, parse_targets_str, substitute_env_vars};
pub use types::{Environment, ShredConfig, TableFilter, TargetsFile};
pub use validator::{validate_config, validate_targets};
