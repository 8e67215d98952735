pub mod test_utils;

mod router_tests;
mod server_tests;
