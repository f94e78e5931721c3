//! Interceptor chain
//!
//! A call travels through an ordered list of [`Interceptor`]s before reaching the base
//! [`Invoker`] that sends it. Each interceptor receives the rest of the chain as a
//! [`Next`] and decides whether, and how often, to run it.
//!
//! The client builds its chain as:
//!
//! ```text
//! ProxyBouncer -> LoggingInterceptor -> MutationRetrier -> ReadRetrier -> ErrorWrapper -> base send
//! ```
//!
//! Outer interceptors run first and see the outcome last. A [`Pipeline`] is immutable once
//! built.

mod bouncer;
mod error_wrapper;
mod logging;
mod mutation;
mod retrier;

pub use bouncer::ProxyBouncer;
pub use error_wrapper::ErrorWrapper;
pub use logging::LoggingInterceptor;
pub use mutation::MutationRetrier;
pub use retrier::ReadRetrier;

use async_trait::async_trait;
use proxyrpc_common::protocol::error::{Result, RpcError};
use std::sync::Arc;

use crate::call::{Call, Reply};
use crate::context::Context;

/// Whether the retriers hand `err` up to the [`ProxyBouncer`] instead of retrying in
/// place. Only unpinned calls can be moved to another proxy.
fn left_to_bouncer(call: &Call, err: &RpcError) -> bool {
    call.requested_proxy.is_none() && err.should_bounce()
}

/// Performs a call.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(&self, ctx: &Context, call: &mut Call) -> Result<Reply>;
}

/// Cross-cutting behavior wrapped around the rest of the chain.
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn intercept(&self, ctx: &Context, call: &mut Call, next: Next<'_>) -> Result<Reply>;
}

/// The remainder of the chain, as seen from one interceptor.
///
/// `Next` is `Copy`: an interceptor may run it any number of times, one run at a time.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    rest: &'a [Arc<dyn Interceptor>],
    base: &'a dyn Invoker,
}

impl<'a> Next<'a> {
    pub async fn run(self, ctx: &Context, call: &mut Call) -> Result<Reply> {
        match self.rest.split_first() {
            Some((first, rest)) => {
                first
                    .intercept(
                        ctx,
                        call,
                        Next {
                            rest,
                            base: self.base,
                        },
                    )
                    .await
            }
            None => self.base.invoke(ctx, call).await,
        }
    }
}

/// An invoker composed of interceptors around a base invoker.
pub struct Pipeline {
    interceptors: Vec<Arc<dyn Interceptor>>,
    base: Arc<dyn Invoker>,
}

impl Pipeline {
    pub fn builder(base: Arc<dyn Invoker>) -> PipelineBuilder {
        PipelineBuilder {
            interceptors: Vec::new(),
            base,
        }
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }
}

#[async_trait]
impl Invoker for Pipeline {
    async fn invoke(&self, ctx: &Context, call: &mut Call) -> Result<Reply> {
        Next {
            rest: &self.interceptors,
            base: self.base.as_ref(),
        }
        .run(ctx, call)
        .await
    }
}

pub struct PipelineBuilder {
    interceptors: Vec<Arc<dyn Interceptor>>,
    base: Arc<dyn Invoker>,
}

impl PipelineBuilder {
    /// Appends an interceptor. Interceptors added first run outermost.
    pub fn with(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            interceptors: self.interceptors,
            base: self.base,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use proxyrpc_common::protocol::Method;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Interceptor for Recorder {
        async fn intercept(&self, ctx: &Context, call: &mut Call, next: Next<'_>) -> Result<Reply> {
            self.log.lock().unwrap().push(format!("enter {}", self.name));
            let result = next.run(ctx, call).await;
            self.log.lock().unwrap().push(format!("leave {}", self.name));
            result
        }
    }

    #[tokio::test]
    async fn test_interceptors_run_outermost_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let base = ScriptedInvoker::new(vec![]);
        let pipeline = Pipeline::builder(base.clone())
            .with(Recorder { name: "outer", log: log.clone() })
            .with(Recorder { name: "inner", log: log.clone() })
            .build();
        assert_eq!(pipeline.len(), 2);

        let mut call = call(Method::GetNode, None);
        pipeline.invoke(&Context::background(), &mut call).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["enter outer", "enter inner", "leave inner", "leave outer"]
        );
        assert_eq!(base.sends(), 1);
    }

    #[tokio::test]
    async fn test_empty_pipeline_calls_base() {
        let base = ScriptedInvoker::new(vec![Err(transport_error())]);
        let pipeline = Pipeline::builder(base.clone()).build();
        assert!(pipeline.is_empty());

        let mut call = call(Method::GetNode, None);
        assert!(pipeline.invoke(&Context::background(), &mut call).await.is_err());
        assert_eq!(base.sends(), 1);
    }
}
