//! Image-to-image backends: parameter mapping, HTTP clients, error
//! classification, and off-thread dispatch.

pub mod backends;
pub mod classify;
pub mod dispatch;
pub mod mapper;
pub mod output;
pub mod registry;
pub mod transport;

pub use backends::{
    capabilities_for, Automatic1111Client, BackendClient, ClientContext, StabilityClient,
    StableHordeClient,
};
pub use dispatch::{run_generation, run_upscale, spawn_generation, spawn_upscale};
pub use mapper::{map, WireParams};
pub use registry::{BackendRegistry, ModelCache};
pub use transport::{HttpTransport, ReqwestTransport, TransportError, WireRequest, WireResponse};
