//! Layer trait and abstractions.
//!
//! Layers wrap providers with cross-cutting concerns such as logging or
//! capability masking. Each layer wraps an inner provider and returns a new
//! provider.

use crate::error::KilnError;
use crate::provider::{ChatProvider, ChunkStream};
use crate::types::*;
use async_trait::async_trait;
use std::sync::Arc;

/// Layer trait for wrapping providers.
pub trait Layer<P: ChatProvider> {
    /// The type of the layered provider
    type LayeredProvider: ChatProvider;

    /// Wrap the inner provider with this layer
    fn layer(&self, inner: P) -> Self::LayeredProvider;
}

/// Helper trait for layered providers.
///
/// Provides forwarding implementations for every provider method.
/// Implementers only override the methods they want to intercept, then
/// use [`impl_layered_provider!`](crate::impl_layered_provider) to derive
/// the provider impl.
#[async_trait]
pub trait LayeredProvider: Sized + ChatProvider {
    /// The inner provider type
    type Inner: ChatProvider;

    /// Get a reference to the inner provider
    fn inner(&self) -> &Self::Inner;

    fn layered_info(&self) -> Arc<ProviderInfo> {
        self.inner().info()
    }

    fn layered_capabilities(&self) -> Capabilities {
        self.inner().capabilities()
    }

    fn layered_invocation_params(&self, options: &CallOptions) -> serde_json::Value {
        self.inner().invocation_params(options)
    }

    async fn layered_generate(
        &self,
        messages: &[Message],
        options: &CallOptions,
    ) -> Result<ChatResult, KilnError> {
        self.inner().generate(messages, options).await
    }

    async fn layered_stream(
        &self,
        messages: &[Message],
        options: &CallOptions,
    ) -> Result<Box<ChunkStream>, KilnError> {
        self.inner().stream(messages, options).await
    }

    fn layered_combine_llm_output(&self, outputs: &[Metadata]) -> Option<Metadata> {
        self.inner().combine_llm_output(outputs)
    }
}

/// Macro to implement ChatProvider by forwarding to LayeredProvider methods.
#[macro_export]
macro_rules! impl_layered_provider {
    ($type:ty) => {
        $crate::impl_layered_provider!($type, []);
    };
    ($type:ty, [$($generics:tt)*]) => {
        #[async_trait::async_trait]
        impl<$($generics)*> $crate::provider::ChatProvider for $type {
            fn info(&self) -> std::sync::Arc<$crate::types::ProviderInfo> {
                $crate::layer::LayeredProvider::layered_info(self)
            }

            fn capabilities(&self) -> $crate::types::Capabilities {
                $crate::layer::LayeredProvider::layered_capabilities(self)
            }

            fn invocation_params(&self, options: &$crate::types::CallOptions) -> $crate::types::Value {
                $crate::layer::LayeredProvider::layered_invocation_params(self, options)
            }

            async fn generate(
                &self,
                messages: &[$crate::types::Message],
                options: &$crate::types::CallOptions,
            ) -> Result<$crate::types::ChatResult, $crate::error::KilnError> {
                $crate::layer::LayeredProvider::layered_generate(self, messages, options).await
            }

            async fn stream(
                &self,
                messages: &[$crate::types::Message],
                options: &$crate::types::CallOptions,
            ) -> Result<Box<$crate::provider::ChunkStream>, $crate::error::KilnError> {
                $crate::layer::LayeredProvider::layered_stream(self, messages, options).await
            }

            fn combine_llm_output(
                &self,
                outputs: &[$crate::types::Metadata],
            ) -> Option<$crate::types::Metadata> {
                $crate::layer::LayeredProvider::layered_combine_llm_output(self, outputs)
            }
        }
    };
}
