//! # Summary Press
//!
//! Upload, validation and publishing service for a book-summary site.
//!
//! A contributor submits a Markdown note (YAML frontmatter + body) and a
//! cover image. The service validates both, publishes them to one or more
//! storage backends (GitHub pull request, SFTP, local checkout), triggers a
//! site rebuild and follows the deploy, streaming progress back as NDJSON.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌────────────────────┐
//! │ Form / CLI   │──▶│  Validation   │──▶│  Publishers         │
//! │ note + cover │   │ frontmatter,  │   │ GitHub / SFTP /     │
//! └──────┬───────┘   │ cover, images │   │ local               │
//!        │           └──────────────┘   └─────────┬──────────┘
//!        │ NDJSON progress                        ▼
//!        │                              ┌────────────────────┐
//!        └──────────────────────────────│ Build hook + deploy │
//!                                       │ tracking            │
//!                                       └────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! press serve                                  # start the upload server
//! press validate notes/dune.md --check-images  # offline checks
//! press submit notes/dune.md --cover dune.png --contributor "Ada"
//! press build check                            # deploy diagnostics
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment secrets |
//! | [`error`] | Validation / transport / configuration error taxonomy |
//! | [`frontmatter`] | YAML frontmatter parsing and rendering |
//! | [`validate`] | Note, cover and schema validation |
//! | [`images`] | Embedded image URL checks |
//! | [`progress`] | Progress events, reporters, NDJSON decoding |
//! | [`tracker`] | Client-side step indicator |
//! | [`temp_store`] | Silent upload storage |
//! | [`storage`] | Publisher trait and backends |
//! | [`deploy`] | Build hook, deploy tracking, diagnostics |
//! | [`pipeline`] | Submission workflow |
//! | [`auth`] | API key check |
//! | [`server`] | HTTP server |
//! | [`client`] | HTTP client for the server |

pub mod auth;
pub mod client;
pub mod config;
pub mod deploy;
pub mod error;
pub mod frontmatter;
pub mod images;
pub mod pipeline;
pub mod progress;
pub mod server;
pub mod storage;
pub mod temp_store;
pub mod tracker;
pub mod validate;
