//! Macros for reducing [`crate::registry::DurableFn`] boilerplate.

/// Implements [`crate::registry::DurableFn`] for a unit struct from a plain
/// async function.
///
/// ```ignore
/// use senpuki::durable_fn;
///
/// async fn fetch_url(url: String, _ctx: senpuki::ExecutionContext) -> anyhow::Result<String> {
///     Ok(reqwest::get(&url).await?.text().await?)
/// }
///
/// durable_fn!(FetchUrl, fetch_url, String, String);
/// ```
///
/// Expands to a `DurableFn` impl whose `NAME` is
/// `concat!(module_path!(), "::", stringify!($name))` and whose `meta()` is
/// the default (activity, `"default"` queue). Use a manual `impl DurableFn`
/// instead when a non-default [`crate::registry::FunctionMeta`] is needed.
#[macro_export]
macro_rules! durable_fn {
    ($name:ident, $func:path, $args:ty, $output:ty) => {
        struct $name;

        impl $crate::DurableFn for $name {
            type Args = $args;
            type Output = $output;

            const NAME: &'static str = concat!(module_path!(), "::", stringify!($name));

            fn call(
                args: Self::Args,
                ctx: $crate::ExecutionContext,
            ) -> futures::future::BoxFuture<'static, Result<Self::Output, $crate::SenpukiError>> {
                Box::pin(async move { $func(args, ctx).await.map_err($crate::SenpukiError::from) })
            }
        }
    };
}
