mod interface;
pub use interface::{is_shutdown, AsWatcher, Event, Pause};

#[cfg(target_os = "linux")]
mod epoll;

#[cfg(target_os = "linux")]
pub use epoll::EpollWatcher as Watcher;
