//! Market Module
//!
//! Simulated spot exchange used by the binary when no live gateway is
//! wired in. It implements the same [`OrderGateway`](crate::grid::executor::OrderGateway)
//! and [`PushChannel`](crate::grid::stream::PushChannel) traits as a real
//! exchange adapter would.

mod paper_trading_market;

pub use paper_trading_market::{split_symbol, FeedKind, PaperExchange, PaperFeed};
