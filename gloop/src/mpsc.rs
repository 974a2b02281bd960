//! Multi-producer single-consumer ring behind [`crate::sync::mpsc`].

pub(crate) mod ring;
