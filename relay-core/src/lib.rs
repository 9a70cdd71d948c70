pub mod config;
pub mod controller;
pub mod cookies;
pub mod error;
pub mod extraction;
pub mod reconcile;
pub mod session;
pub mod supervisor;

pub use config::{load_relay_config, ExtractionConfig, KindSection, RelayConfig};
pub use controller::{AddSessionRequest, ControllerError, ControllerResult, SessionController};
pub use cookies::{CookieError, CookieJar};
pub use error::{ConfigError, ErrorKind, Result};
pub use extraction::{
    ExtractionContext, ExtractionPipeline, ExtractionRequest, ExtractionResult,
    ExtractionStrategy, LinkRecord, StrategyError, StrategyOutcome, StreamFormat, TriedMethod,
};
pub use reconcile::{reconcile, ReconcileError, ReconcileReport, StatusChange};
pub use session::{
    mask_credential, RegistryBackend, RegistryError, RegistryLockGuard, SessionKind,
    SessionRegistry, SessionStatus, StreamSession,
};
pub use supervisor::{
    CommandExecutor, ProcessSupervisor, SupervisorError, SystemCommandExecutor, TmuxSupervisor,
    WorkerCommand, WorkerCommandBuilder, NO_OUTPUT_PLACEHOLDER,
};
