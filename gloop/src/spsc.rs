//! Single-producer single-consumer ring shared by the IPC queues.

pub(crate) mod ring;
