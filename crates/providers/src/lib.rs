pub mod http;
pub mod provider;

pub use http::{HttpGenerationProvider, HttpProviderConfig};
pub use provider::{
    CancelFlag, ChatOptions, GenerationProvider, ImageOptions, Polled, PollOptions,
    ProviderError, RenderHandle, RenderModification, TaskHandle, TaskOutput, VideoRequest,
};
