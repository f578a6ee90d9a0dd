//! HTTP/1.x protocol implementation.
//!
//! # Architecture
//!
//! - **`connection`**: per-connection request loop with input timeouts and keep-alive
//! - **`parser`**: strict request-head parsing from a byte buffer
//! - **`request`**: request representation and header accessors
//! - **`response`**: response representation, streamed bodies, builder
//! - **`writer`**: serializes a response and streams its body to the client
//! - **`mime`**: content types by file extension
//! - **`date`**: HTTP-date formatting and parsing
//!
//! # Connection State Machine
//!
//! ```text
//!        ┌─────────────┐
//!        │   Reading   │ ← header section (15 s), then body (30 s)
//!        └──────┬──────┘
//!               │ request read          │ malformed / timed out
//!               ▼                       ▼
//!        ┌──────────────────┐   ┌──────────────────┐
//!        │   Processing     │   │    Rejecting     │
//!        └──────┬───────────┘   └──────┬───────────┘
//!               │ response written     │
//!               ▼                      ▼
//!        ┌──────────────────────────────────┐
//!        │             Logging              │
//!        └──────┬───────────────────────────┘
//!               ├─ Keep-Alive → Reading (same connection)
//!               └─ Close → Closed
//! ```

pub mod request;
pub mod response;
pub mod parser;
pub mod connection;
pub mod writer;
pub mod mime;
pub mod date;
