pub mod clock;
pub mod config;
pub mod config_loader;
pub mod error;
pub mod events;
pub mod order;
pub mod position;
pub mod position_sizing;
pub mod store;
pub mod trading_state;
pub mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AllocatorConfig, AppConfig, BucketConfig, CircuitBreakerConfig, CollectorConfig,
    DatabaseConfig, EventLoopConfig, RateLimitsConfig, RetryConfig, RiskConfig, StrategyConfig,
    TradingConfig, TradingMode,
};
pub use config_loader::ConfigLoader;
pub use error::{StateError, StoreError};
pub use events::{
    Event, EventKind, EventMeta, FillEvent, HealthStatus, KillSwitchEvent, MarketEvent,
    OrderIntentEvent, OrderSubmissionEvent, PositionUpdateEvent, PositionUpdateType,
    RiskApprovalEvent, Severity, Side, SignalEvent, SystemHealthEvent,
};
pub use order::{Order, OrderStatus};
pub use position::Position;
pub use position_sizing::{calculate_required_margin, PositionSizer, SizingConfig};
pub use store::{Row, SqlValue, Statement, Store};
pub use trading_state::{StateSnapshot, TradingState};
pub use traits::{DataProvider, Strategy};
