pub mod api;
pub mod manager;
pub mod mock;
pub mod registry;

pub use api::{
    ApiClient, Balance, Page, PageRequest, PriceQuote, ProviderError, ProviderErrorKind,
    ProviderOp, ProviderRequest, ProviderResponse, TokenInfo,
};
pub use manager::{ManagerConfig, ProviderManager, StreamBatch, StreamRequest};
pub use registry::{
    Factory, ProviderConfig, ProviderMetadata, RegisteredProvider, Registry, ReplayWindow,
};
