//! # Differentiable Function units (`func`)
//!
//! Every operation in this module is a stateless unit implementing the
//! forward/backward contract:
//!
//! - `forward(cache, inputs…, params…) -> Result<Tensor>` computes the
//!   output and pushes whatever state its backward step will need onto the
//!   shared [`FunctionCache`](crate::cache::FunctionCache).
//! - `backward(cache, grad_output) -> Result<grads>` pops that state and
//!   returns one gradient per differentiable input, in forward input
//!   order. Static parameters (strides, padding modes, kernel sizes)
//!   produce no gradient slot; optional parameters that did not request a
//!   gradient come back as `None` rather than a zero tensor.
//!
//! Composite forwards (the fused convolutions) call sub-function forwards
//! with the *same* cache, so their backwards must unwind the sub-function
//! backwards in exact reverse call order. The cache enforces this LIFO
//! discipline by failing loudly on any out-of-order pop.
//!
//! All per-call state lives in the cache, never in the unit itself, so the
//! same unit can serve concurrent calls as long as each call owns its own
//! cache instance.

pub mod activation;
pub mod conv;
pub mod dilate;
pub mod embedding;
pub mod linear;
pub mod pad;
pub mod pool;

pub use activation::{
    log_softmax, softmax, temperature_softmax, LeakyReLU, ReLU, Sigmoid, Tanh, GELU,
};
pub use conv::{convolve1d, convolve2d, Convolution1d, Convolution2d, RawConv1d, RawConv2d};
pub use dilate::{Dilate1d, Dilate2d};
pub use embedding::{lookup_embedding, one_hot_encode, Embedding};
pub use linear::Linear;
pub use pad::{Pad1d, Pad2d, Padding};
pub use pool::{avgpooling2d, maxpooling2d, upsample2d, AvgPooling2d, MaxPooling2d};
