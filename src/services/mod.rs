//! Service layer: storage backends and everything built on top of them.

pub mod access;
pub mod audit;
pub mod file_service;
pub mod folder_tree;
pub mod folder_upload;
pub mod multipart;
pub mod naming;
pub mod preview;
pub mod sequence;
pub mod storage;
pub mod transcode;
pub mod zip_builder;
