//! clusterfs: a POSIX-like filesystem whose inodes, directory entries and data
//! blocks are rows in an etcd/Xline cluster, so every host mounting the same
//! scope sees the same tree.

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod fuse;
pub mod meta;
pub mod store;
pub mod vfs;
