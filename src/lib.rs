pub mod api;
pub mod app;
pub mod blacklist;
pub mod catalog;
pub mod config;
pub mod db;
pub mod downloader;
pub mod events;
pub mod feeds;
pub mod filer;
pub mod jobs;
pub mod naming;
pub mod numbering;
pub mod release;
pub mod schedule;
pub mod services;
