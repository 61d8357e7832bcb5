//! In-memory stand-ins for the platform and the relay.

mod devices;
mod peer;
mod relay;
mod sink;

pub use devices::FakeDevices;
pub use peer::{FakePeer, FakePeerFactory};
pub use relay::TestRelay;
pub use sink::RecordingSink;

use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};

pub fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
