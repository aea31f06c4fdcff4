//! # Soundboard
//!
//! Data maintenance for a Spotify charts dashboard. Weekly per-country
//! top-100 charts are downloaded, parsed, enriched with artist genres from
//! the music catalog, merged into a rolling 52-week dataset and published
//! to an S3 bucket, where the dashboard reads it back.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐
//! │  Charts  │──▶│  Parser  │──▶│  Genres  │──▶│  Asset   │
//! │ fetcher  │   │  (CSV)   │   │ (catalog)│   │ builder  │
//! └──────────┘   └──────────┘   └──────────┘   └────┬─────┘
//!                                                   │
//!                      ┌──────────────┐        ┌────▼─────┐
//!                      │ HTTP trigger │───────▶│  Store   │
//!                      │  + views     │◀───────│  (S3)    │
//!                      └──────────────┘        └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! soundboard maintain --mode deploy     # cold start: last 53 weeks
//! soundboard maintain                   # weekly update
//! soundboard status                     # remote freshness marker
//! soundboard serve                      # trigger endpoint + views
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`dates`] | Reporting-week arithmetic |
//! | [`models`] | Chart records and genre maps |
//! | [`charts`] | Chart fetcher |
//! | [`parser`] | Chart file parser |
//! | [`catalog`] | Music-catalog API client |
//! | [`genres`] | Genre resolver |
//! | [`asset`] | Dataset builder and persisted formats |
//! | [`store`] | Object store gateway |
//! | [`store_s3`] | S3 backend with SigV4 signing |
//! | [`maintain`] | Maintenance orchestrator |
//! | [`views`] | Dashboard aggregations |
//! | [`cache`] | View cache |
//! | [`server`] | Trigger and views HTTP server |
//! | [`logging`] | Tracing subscriber setup |

pub mod asset;
pub mod cache;
pub mod catalog;
pub mod charts;
pub mod config;
pub mod dates;
pub mod error;
pub mod genres;
pub mod logging;
pub mod maintain;
pub mod models;
pub mod parser;
pub mod server;
pub mod store;
pub mod store_s3;
pub mod views;
