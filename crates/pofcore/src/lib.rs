//! # PoF Core Node
//!
//! The embeddable PoF Core node: wires configuration, keys, the ledger
//! collaborators and both meshes into a running [`FormulatorNode`].
//!
//! Library embedders construct a [`Node`] with their own
//! [`pofcore_chain::Chain`] implementation; the bundled binary runs against
//! the in-memory reference chain.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod node;

pub use node::{Node, NodeError};
pub use pofcore_consensus::FormulatorNode;
