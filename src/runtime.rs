use std::time::Duration;

#[cfg(feature = "redis-tokio")]
pub(crate) async fn async_sleep(d: Duration) {
    tokio::time::sleep(d).await;
}

#[cfg(all(feature = "redis-smol", not(feature = "redis-tokio")))]
pub(crate) async fn async_sleep(d: Duration) {
    smol::Timer::after(d).await;
}
