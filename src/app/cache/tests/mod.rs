//! Cache integration tests

mod integration_tests;
