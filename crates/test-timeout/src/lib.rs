use proc_macro::TokenStream;
use quote::quote;
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Attribute, Expr, ExprLit, ItemFn, Lit, Token};

struct Options {
    timeout_secs: u64,
    paused: bool,
}

fn parse_options(args: Punctuated<Expr, Token![,]>) -> syn::Result<Options> {
    let mut options = Options {
        timeout_secs: 60,
        paused: false,
    };
    for arg in args {
        match &arg {
            Expr::Lit(ExprLit {
                lit: Lit::Int(lit), ..
            }) => {
                let secs: u64 = lit.base10_parse()?;
                if secs == 0 {
                    return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
                }
                options.timeout_secs = secs;
            }
            Expr::Path(path) if path.path.is_ident("paused") => options.paused = true,
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "expected a timeout in seconds or `paused`",
                ))
            }
        }
    }
    Ok(options)
}

/// Async test on a current-thread runtime, failed if it runs longer than the
/// given number of seconds (default 60). With `paused` the tokio clock starts
/// paused and auto-advances while the test is idle.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr with Punctuated::<Expr, Token![,]>::parse_terminated);
    let options = match parse_options(args) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }

    sig.asyncness = None;

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    let timeout = options.timeout_secs;
    let pause = if options.paused {
        quote! { builder.start_paused(true); }
    } else {
        quote! {}
    };

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let mut builder = tokio::runtime::Builder::new_current_thread();
                    builder.enable_all();
                    #pause
                    let runtime = builder.build().expect("failed to build Tokio runtime");
                    runtime.block_on(async {
                        tokio::time::timeout(timeout_duration, async move #block)
                            .await
                            .expect("test timed out");
                    });
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
