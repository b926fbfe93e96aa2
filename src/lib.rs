//! # inox - Arduino sketch build engine
//!
//! inox turns a sketch folder into firmware by driving the toolchain
//! described in a platform's `platform.txt` and `boards.txt` recipes.
//!
//! ## Features
//!
//! - **Recipe Driven**: every compile, archive and link command comes from the platform
//! - **Incremental**: `.d` dependency files decide what is recompiled
//! - **Library Discovery**: `#include` directives pull in the libraries they need
//! - **Prototypes**: forward declarations for sketch functions via ctags
//! - **Core Cache**: compiled cores are shared between sketches
//!
//! ## Quick Start
//!
//! ```bash
//! inox compile Blink --fqbn arduino:avr:uno --hardware /opt/arduino/hardware
//! ```
//!
//! ## Module Organization
//!
//! - [`build`] - Build stages and the shared [`build::Context`]
//! - [`builder`] - The ordered stage list of a full build
//! - [`properties`] - Property maps and `{key}` expansion
//! - [`hardware`] - Platforms, boards and tools
//! - [`library`] - Library metadata and the header index

/// Build stages, process execution and incremental compilation.
pub mod build;

/// The full build pipeline.
pub mod builder;

/// Shared cache of compiled cores.
pub mod cache;

/// Configuration file parsing (`inox.toml`).
pub mod config;

/// Typed build errors.
pub mod error;

/// Fully qualified board names.
pub mod fqbn;

/// Platform and board discovery.
pub mod hardware;

/// Libraries and header resolution.
pub mod library;

/// `key=value` property files and recipe expansion.
pub mod properties;

/// Sketch loading and merging.
pub mod sketch;

/// Terminal UI utilities (tables).
pub mod ui;

pub use error::BuildError;
