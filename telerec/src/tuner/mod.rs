//! Tuner management: the tuner table with transponder locks and the
//! allocation walk that picks a tuner able to serve a channel.

pub mod allocator;

pub use allocator::{select_tuner, AllocateError, Selection, Tuner, TunerTable};
