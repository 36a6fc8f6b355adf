//! Test attributes that fail a test instead of letting it hang.
//!
//! Signaling tests suspend on round trips that may never be acknowledged; the
//! body runs on a helper thread and the harness gives up once the budget is
//! spent.
//!
//! ```ignore
//! #[test_timeout::timeout]
//! fn parses() { /* ... */ }
//!
//! #[test_timeout::tokio_timeout_test(10)]
//! async fn round_trip() { /* ... */ }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Async test body driven by a current-thread Tokio runtime.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = match parse_budget(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let mut function = parse_macro_input!(item as ItemFn);

    if function.sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &function.sig.ident,
            "tokio_timeout_test expects an async fn",
        )
        .to_compile_error()
        .into();
    }
    function.sig.asyncness = None;

    let block = &function.block;
    let body = quote! {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async {
            tokio::time::timeout(budget, async move #block)
                .await
                .expect("test timed out");
        });
    };

    expand(function, secs, body, is_path(&["tokio", "test"]))
}

/// Synchronous test body.
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = match parse_budget(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let function = parse_macro_input!(item as ItemFn);

    if function.sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &function.sig.ident,
            "timeout expects a synchronous fn; use tokio_timeout_test for async tests",
        )
        .to_compile_error()
        .into();
    }

    let block = &function.block;
    let body = quote! {
        let _ = budget;
        #block
    };

    expand(function, secs, body, is_path(&["test"]))
}

fn parse_budget(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let literal: LitInt = syn::parse(attr)?;
    let secs: u64 = literal.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(
            literal,
            "timeout must be greater than zero",
        ));
    }
    Ok(secs)
}

fn is_path(expected: &'static [&'static str]) -> impl Fn(&Attribute) -> bool {
    move |attr| {
        let segments: Vec<String> = attr
            .path()
            .segments
            .iter()
            .map(|segment| segment.ident.to_string())
            .collect();
        segments.iter().map(String::as_str).eq(expected.iter().copied())
    }
}

/// Emits a `#[test]` that runs `body` on a worker thread and waits at most
/// `secs` for it to report back. `budget` is in scope inside `body`.
fn expand(
    function: ItemFn,
    secs: u64,
    body: TokenStream2,
    duplicate_attr: impl Fn(&Attribute) -> bool,
) -> TokenStream {
    let ItemFn { attrs, vis, sig, .. } = function;
    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !duplicate_attr(attr))
        .collect();

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let budget = std::time::Duration::from_secs(#secs);
            let (report, outcome) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    #body
                }));
                let _ = report.send(result);
            });
            match outcome.recv_timeout(budget) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {}s budget", #secs)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting")
                }
            }
        }
    })
}
