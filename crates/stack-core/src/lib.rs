pub mod client;
pub mod deadline;
pub mod env;
pub mod error;
pub mod status;

pub use client::{
    is_controller_client, BootstrapOptions, Client, ClientFactory, SharedClient, SubstrateClient,
    SubstrateClientFactory, VersionProfile,
};
pub use deadline::ExecBackend;
pub use env::{
    default_config_home, update_env, EnvUpdateParams, ModelEnv, CONTROLLER_MODEL_NAME,
};
pub use error::{
    command_failure, is_soft_deadline, CommandError, LoggedError, SoftDeadlineExceeded, Terminated,
};
pub use status::{MachineStatus, Status};
