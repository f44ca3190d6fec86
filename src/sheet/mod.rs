//! Character sheet state engine.
//!
//! This module provides:
//! - `model`: views, part sheets, keys and snapshots
//! - `history`: bounded undo/redo shared by every entity
//! - `ledger`: ordered modification requests replayed into generation
//! - `store`: the owned entity store with its activity registry
//! - `resolver`: reference selection governed by the reference balance

pub mod history;
pub mod ledger;
pub mod model;
pub mod resolver;
pub mod store;

pub use history::{HistoryState, Versioned, DEFAULT_HISTORY_LIMIT};
pub use ledger::{render_instructions, Ledger, Modification};
pub use model::*;
pub use resolver::{resolve_sources, resolve_sources_with, weighting_annotation, ResolvedSources};
pub use store::{EntityStore, RequestTicket, MAX_BALANCE};
