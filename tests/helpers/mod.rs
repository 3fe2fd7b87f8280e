//! Test helpers: plaintext mock servers for wire-level assertions.

pub mod mock_h1_server;
pub mod mock_h2_server;
