pub mod config;
pub mod error;
pub mod feed;
pub mod fetch;
pub mod index;
pub mod model;
pub mod parser;
pub mod persist;
pub mod query;
pub mod scheduler;
pub mod server;
pub mod snapshot;
pub mod trajectory;

pub mod gtfs_rt {
    include!(concat!(env!("OUT_DIR"), "/transit_realtime.rs"));
}
