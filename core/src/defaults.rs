//! Cascading defaults as an immutable chain of override layers.
//!
//! Each `extend` returns a new chain whose head points at the parent's head,
//! so derived dispatchers share their ancestors' layers without copying and
//! without any way to mutate them.

use std::sync::Arc;

use crate::options::RequestOptions;

struct Layer {
    options: RequestOptions,
    parent: Option<Arc<Layer>>,
}

/// Ordered override layers; later layers win per key.
#[derive(Clone, Default)]
pub struct DefaultsChain {
    head: Option<Arc<Layer>>,
    len: usize,
}

impl DefaultsChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new chain with `layer` on top. `self` is unchanged.
    pub fn extend(&self, layer: RequestOptions) -> Self {
        Self {
            head: Some(Arc::new(Layer {
                options: layer,
                parent: self.head.clone(),
            })),
            len: self.len + 1,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Layers from the base outwards.
    pub fn layers(&self) -> Vec<&RequestOptions> {
        let mut layers = Vec::with_capacity(self.len);
        let mut cursor = self.head.as_deref();
        while let Some(layer) = cursor {
            layers.push(&layer.options);
            cursor = layer.parent.as_deref();
        }
        layers.reverse();
        layers
    }

    /// Fresh record: every layer in order, then `call` on top.
    pub fn compose(&self, call: RequestOptions) -> RequestOptions {
        let base = self
            .layers()
            .into_iter()
            .fold(RequestOptions::default(), |merged, layer| merged.overlay(layer));
        base.overlay(&call)
    }
}

impl std::fmt::Debug for DefaultsChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.layers()).finish()
    }
}
