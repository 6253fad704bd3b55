//! pulse-backend - Split-order execution engine
//!
//! A client submits a parent order to trade quantity Q over duration D in N
//! time-staggered child slices. The engine persists the order, splits it
//! transactionally, schedules each slice, places it with an external broker,
//! and monitors it to a terminal state - tolerating worker crashes, broker
//! flakiness, and concurrent operators.
//!
//! # Modules
//!
//! - [`core_types`] - Identifier generation and prefixes
//! - [`context`] - Immutable request context for tracing
//! - [`config`] - Environment-variable configuration
//! - [`logging`] - tracing-subscriber setup
//! - [`models`] - Domain enums and entity records
//! - [`db`] - PostgreSQL pool and schema bootstrap
//! - [`store`] - Per-table stores with pessimistic claim queries
//! - [`planner`] - Pure quantity/time split planner
//! - [`broker`] - Broker adapter contract, mock, and Zerodha client
//! - [`workers`] - Splitting worker, execution worker, timeout monitor,
//!   cancellation handler

pub mod core_types;

pub mod config;
pub mod context;
pub mod logging;

pub mod models;

pub mod db;
pub mod store;

pub mod broker;
pub mod planner;
pub mod workers;

// Convenient re-exports at crate root
pub use broker::{BrokerAdapter, BrokerError, BrokerOrderReply, MockBroker, PlaceOrderRequest};
pub use config::{MockScenario, Settings};
pub use context::RequestContext;
pub use db::Database;
pub use models::{
    BrokerEvent, BrokerOrderStatus, Execution, ExecutionResult, ExecutionStatus, NewOrder, Order,
    OrderSlice, OrderType, QueueStatus, Side, SliceStatus,
};
pub use planner::{SplitSlice, calculate_split_schedule};
pub use store::{
    BrokerEventStore, ExecutionStore, OrderStore, SliceStore, StoreError,
};
pub use workers::{CancellationHandler, ExecutionWorker, SplittingWorker, TimeoutMonitor};
