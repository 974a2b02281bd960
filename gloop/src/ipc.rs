//! Cross-process plumbing between the monitor and its clients.
//!
//! - [`shmem`] maps typed POSIX shared memory
//! - [`spsc`] is a lock-free queue living in such a mapping
//! - [`channel`] names and builds the queue pair and shared region of one session

pub mod channel;
pub mod shmem;
pub mod spsc;
