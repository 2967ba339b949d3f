pub mod access;
pub mod invoker;
pub mod synthesizer;

pub use access::{
    AccessHandle, NoopPermissions, PermissionToggler, RepoGuard, RepositoryLockError,
    TreePermissions,
};
pub use invoker::{
    augment_query, Admission, AgentInvocation, AgentPool, AgentResult, AgentStatus, AnalysisAgent,
    InvokeError, ProcessAgent,
};
pub use synthesizer::{ResponseSynthesizer, Synthesis};
