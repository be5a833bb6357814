pub mod download;
pub mod info;
pub mod run;
pub mod serve;
