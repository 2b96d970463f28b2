#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

//! # display-core: hardware layer composition for display controllers
//!
//! This crate decides, frame by frame, which layers of a composition are
//! scanned out directly by the pipes of a display controller and which ones are
//! left to the GPU. It validates every decision against the capabilities of the
//! hardware and keeps the bookkeeping of the pipes and rotator sessions shared
//! between all displays of a device.
//!
//! ## Structure of the crate
//!
//! - [`hw`] describes the capabilities of the hardware, probed once at startup.
//! - [`layer`] contains the layer stack handed in for every frame.
//! - [`strategy`] selects candidate assignments of layers to hardware.
//! - [`manager`] binds a candidate to pipes, rotators and scalers, or rejects it.
//! - [`pool`] keeps track of which display claims which pipe or rotator session.
//! - [`scalar`] computes scaler programming for scaled pipes.
//! - [`sync`] waits on the acquire fences of layer buffers.
//! - [`display`] ties these together into the per-frame prepare and commit cycle.
//! - [`dump`] renders the allocation state for diagnostics.
//!
//! ## Frame cycle
//!
//! A [`DisplayCore`](display::DisplayCore) is created from a
//! [`ResourceProbe`](hw::ResourceProbe) and owns the shared pools. Every
//! [`Display`](display::Display) created from it is driven by two calls per
//! frame: [`prepare`](display::Display::prepare) selects the hardware
//! configuration, [`commit`](display::Display::commit) waits for the buffers
//! and hands the configuration to the hardware. If no candidate fits, the
//! frame is composed entirely by the GPU, this is never an error.
//!
//! Displays may be driven from different threads. Each display serializes its
//! own frames, the pools are only locked for the duration of one allocation.
//!
//! ### Logging
//!
//! display-core makes extensive use of [`tracing`] for its internal logging.
//!
//! For release builds it is recommended to limit the log level during compile time.
//! This can be done by adding a dependency to [`tracing`] and enabling the corresponding features.
//! For example to enable `trace` messages for debug builds, but limit release builds to `debug` add
//! the following in your binary crate `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```
//!
//! Rejected candidates are logged at `debug`, every attempt runs in a `trace`
//! span. Falling back to the GPU and dropping frames on fence timeouts are
//! logged as warnings.

pub mod display;
pub mod dump;
pub mod format;
pub mod hw;
pub mod layer;
pub mod manager;
pub mod pool;
pub mod scalar;
pub mod strategy;
pub mod sync;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_utils;
