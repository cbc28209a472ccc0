//! Capability masking for streaming.

use kiln_core::layer::{Layer, LayeredProvider};
use kiln_core::provider::ChatProvider;
use kiln_core::types::Capabilities;

/// Makes a provider report that it cannot stream.
///
/// Batch calls then always dispatch directly, and `ChatModel::stream`
/// falls back to a single chunk.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisableStreamingLayer;

impl<P: ChatProvider> Layer<P> for DisableStreamingLayer {
    type LayeredProvider = NonStreamingProvider<P>;

    fn layer(&self, inner: P) -> Self::LayeredProvider {
        NonStreamingProvider { inner }
    }
}

/// Provider with its streaming capability hidden
#[derive(Debug)]
pub struct NonStreamingProvider<P> {
    inner: P,
}

impl<P: ChatProvider> LayeredProvider for NonStreamingProvider<P> {
    type Inner = P;

    fn inner(&self) -> &Self::Inner {
        &self.inner
    }

    fn layered_capabilities(&self) -> Capabilities {
        self.inner.capabilities().with_streaming(false)
    }
}

kiln_core::impl_layered_provider!(NonStreamingProvider<P>, [P: ChatProvider]);
