/// Compile-time tests to verify Send/Sync bounds are correct for each feature
///
/// These tests don't run at runtime - they're designed to pass or fail at compile time.
/// Run with:
///   cargo test --features send  (default)
///   cargo test --no-default-features --features local
use writable_streams::{
    OperationFuture, SignalFuture, StreamError, WritableSink, WritableStream,
    WritableStreamDefaultController, WritableStreamDefaultWriter,
};

fn assert_send<T: Send>() {}

fn assert_sync<T: Sync>() {}

#[derive(Clone)]
struct DummySink;

impl WritableSink<String> for DummySink {
    async fn write(
        &mut self,
        _chunk: String,
        _controller: &mut WritableStreamDefaultController,
    ) -> Result<(), StreamError> {
        Ok(())
    }
}

#[cfg(not(feature = "local"))]
#[test]
fn test_send_feature_handles_are_send_sync() {
    assert_send::<WritableStream<String, DummySink>>();
    assert_sync::<WritableStream<String, DummySink>>();
    assert_send::<WritableStreamDefaultWriter<String, DummySink>>();
    assert_sync::<WritableStreamDefaultWriter<String, DummySink>>();
    assert_send::<WritableStreamDefaultController>();
    assert_send::<OperationFuture>();
    assert_send::<SignalFuture>();
    assert_send::<StreamError>();
    assert_sync::<StreamError>();
}

#[cfg(feature = "local")]
#[test]
fn test_local_feature_sinks_not_required_to_be_send() {
    use std::cell::RefCell;
    use std::rc::Rc;

    // Rc state is fine in a local sink
    struct RcSink(Rc<RefCell<Vec<String>>>);

    impl WritableSink<String> for RcSink {
        async fn write(
            &mut self,
            chunk: String,
            _controller: &mut WritableStreamDefaultController,
        ) -> Result<(), StreamError> {
            self.0.borrow_mut().push(chunk);
            Ok(())
        }
    }

    let log = Rc::new(RefCell::new(Vec::new()));
    let built = WritableStream::builder(RcSink(Rc::clone(&log))).prepare();
    assert!(built.is_ok());
}

#[test]
fn test_basic_stream_compilation() {
    let built = WritableStream::builder(DummySink).prepare();
    assert!(built.is_ok());
}
