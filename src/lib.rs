//! Control plane for supervising Firecracker-class microVMs.
//!
//! [`control_plane::ControlPlane`] is the top-level entry point: it creates and
//! re-attaches to [`supervisor::Supervisor`]s, each of which owns a VMM process
//! ([`vmm`]), a [`console::ConsoleMultiplexer`], an [`router::AgentSessionRouter`]
//! talking the protocol in [`agent_protocol`], and (when vsock is enabled) a
//! [`vsock::listener::VsockHostListener`] speaking [`vsock::protocol`].

pub mod agent_protocol;
pub mod allocator;
pub mod console;
pub mod control_plane;
pub mod model;
pub mod router;
pub mod supervisor;
pub mod vmm;
pub mod vsock;
