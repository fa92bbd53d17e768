pub mod db;
pub mod ingest;
pub mod notify;
pub mod ozf;
pub mod slurs;
pub mod steamid;
pub mod tracing;
pub mod wordlist;

pub mod util {
    pub mod env;
}
