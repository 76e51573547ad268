pub mod api;
pub mod checkout;
pub mod config;
pub mod conversation;
pub mod db;
pub mod intake;
pub mod jobs;
pub mod pipeline;
pub mod remote;
pub mod scripts;
pub mod worker;

#[cfg(test)]
mod test_support;
