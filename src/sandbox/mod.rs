//! Sandbox Runtime & Message Router (`SPEC_FULL.md` §4.3): an isolated
//! execution context for untrusted model-generated code, a process-wide
//! message router that fans inbound sandbox messages out to providers and
//! consumers, and the standard runtime providers (console, attachments,
//! downloadable files, artifacts) every sandbox is wired up with.
//!
//! See [`runtime`] for the [`Sandbox`]/[`SandboxTransport`] primitives,
//! [`router`] for the process-wide routing facade, and [`providers`] for
//! the [`RuntimeProvider`]/[`RuntimeConsumer`] traits and standard providers.

pub mod providers;
pub mod router;
pub mod runtime;

pub use providers::{
    Attachment, AttachmentsProvider, ArtifactStore, ArtifactsProvider, ConsoleProvider,
    DownloadableFileProvider, InMemoryArtifactStore, RespondFn, RuntimeConsumer, RuntimeProvider,
};
pub use router::{add_consumer, register_sandbox, remove_consumer, route, set_sandbox_transport, unregister_sandbox};
pub use runtime::{
    AUTO_COMPLETE_DELAY, ChannelTransport, ConsoleEntry, Sandbox, SandboxMessage, SandboxOutcome,
    SandboxTransport,
};
