/// Turns an `async fn` whose arguments borrow for `'a` into a plain `fn`
/// returning a boxed future, so it can be stored as a test body.
///
/// ```ignore
/// dyn_async! {
///     async fn my_test<'a>(test: &'a mut Test, client: Client, _: ()) {
///         test.log("running");
///     }
/// }
/// ```
#[macro_export]
macro_rules! dyn_async {(
    $( #[$attr:meta] )*
    $pub:vis
    async
    fn $fname:ident<$lt:lifetime> ( $($args:tt)* ) $(-> $Ret:ty)?
    {
        $($body:tt)*
    }
) => (
    $( #[$attr] )*
    #[allow(unused_parens)]
    $pub
    fn $fname<$lt> ( $($args)* ) -> ::std::pin::Pin<::std::boxed::Box<
        dyn ::std::future::Future<Output = ($($Ret)?)>
            + ::std::marker::Send + $lt
    >>
    {
        ::std::boxed::Box::pin(async move { $($body)* })
    }
)}
