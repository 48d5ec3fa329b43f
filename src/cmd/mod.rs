pub mod check_config;
pub mod inspect_pfx;
pub mod serve;
