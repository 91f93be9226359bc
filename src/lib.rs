pub mod backend;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gpio;
pub mod registry;
pub mod routes;
pub mod service;
pub mod waiter;
pub mod watch;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use config::{AppConfig, EdgeDetect, GpioCapability, HttpConfig, PinConfig};
pub use dispatch::Dispatcher;
pub use error::AppError;
pub use gpio::{EdgeEvent, EventHandler, GpioManager, PinDescriptor};
pub use registry::{CallbackRegistry, EdgeCallback, HandlerEntry, HandlerError};
pub use routes::AppState;
pub use service::EdgeService;
pub use waiter::BlockingWaiter;
pub use watch::{Direction, EdgeDispatch, EdgeWatch, GpioBackend, PinControl, Pull, WaitOutcome};

#[cfg(feature = "hardware-gpio")]
pub use backend::LibgpiodBackend;
pub use backend::MockGpioBackend;
