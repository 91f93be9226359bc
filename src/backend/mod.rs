#[cfg(feature = "hardware-gpio")]
pub mod libgpiod;
#[cfg(any(feature = "hardware-gpio", test))]
mod listener;
pub mod mock;

#[cfg(feature = "hardware-gpio")]
pub use libgpiod::LibgpiodBackend;
pub use mock::MockGpioBackend;
