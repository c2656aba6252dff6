pub mod credential;
pub mod events;
pub mod http;
pub mod port_alloc;
pub mod probe;
pub mod proxy;
pub mod reaper;
pub mod registry;
pub mod settings;
pub mod supervisor;
