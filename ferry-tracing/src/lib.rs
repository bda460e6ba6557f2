extern crate proc_macro;

use proc_macro2::TokenStream;
use quote::{quote, quote_spanned};
use syn::{ItemFn, Stmt, parse::Parse, parse_macro_input, parse_quote};

/// Unit the exit event reports elapsed time in.
#[derive(PartialEq, Eq, Clone, Copy, Default)]
enum Precision {
    #[default]
    Nanos,
    Micros,
    Millis,
    Seconds,
}

impl Precision {
    fn parse_unit(value: &str) -> Option<Self> {
        match value {
            "ns" | "nanos" | "nanoseconds" => Some(Self::Nanos),
            "us" | "micros" | "microseconds" => Some(Self::Micros),
            "ms" | "millis" | "milliseconds" => Some(Self::Millis),
            "s" | "secs" | "seconds" => Some(Self::Seconds),
            _ => None,
        }
    }

    /// Expression rendering `elapsed` (a `Duration`) in this unit.
    fn render(self) -> syn::Expr {
        match self {
            Self::Nanos => parse_quote!(format!("{} ns", elapsed.as_nanos())),
            Self::Micros => parse_quote!(format!("{} us", elapsed.as_micros())),
            Self::Millis => parse_quote!(format!("{} ms", elapsed.as_millis())),
            Self::Seconds => parse_quote!(format!("{:.3} s", elapsed.as_secs_f64())),
        }
    }
}

mod keywords {
    syn::custom_keyword!(timing);
    syn::custom_keyword!(precision);
    syn::custom_keyword!(instrument);
}

#[derive(Default)]
struct Attributes {
    timing: Option<Precision>,
    instrument: Option<TokenStream>,
    unrecognised: Vec<syn::Error>,
}

impl Attributes {
    fn parse_timing(input: syn::parse::ParseStream) -> syn::Result<Precision> {
        if !input.peek(syn::token::Paren) {
            return Ok(Precision::default());
        }

        let content;
        syn::parenthesized!(content in input);
        content.parse::<keywords::precision>()?;
        content.parse::<syn::Token![=]>()?;
        let unit = content.parse::<syn::LitStr>()?;

        Precision::parse_unit(&unit.value())
            .ok_or_else(|| syn::Error::new(unit.span(), "unknown timing precision"))
    }

    /// Surface unexpected arguments as deprecation warnings rather than
    /// hard errors, so a typo never breaks the build.
    fn warnings(&self) -> TokenStream {
        let warnings = self.unrecognised.iter().map(|err| {
            let msg = syn::LitStr::new(&format!("ignored traced argument, {err}"), err.span());

            quote_spanned! {err.span()=>
                #[warn(deprecated)]
                {
                    #[deprecated(since = "never", note = #msg)]
                    const TRACED_ARGUMENT_IGNORED: () = ();
                    let () = TRACED_ARGUMENT_IGNORED;
                }
            }
        });

        quote! { #(#warnings)* }
    }
}

impl Parse for Attributes {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        let mut attributes = Self::default();

        while !input.is_empty() {
            let lookahead = input.lookahead1();
            if lookahead.peek(keywords::timing) {
                if attributes.timing.is_some() {
                    return Err(input.error("`timing` given more than once"));
                }
                input.parse::<keywords::timing>()?;
                attributes.timing = Some(Self::parse_timing(input)?);
            } else if lookahead.peek(keywords::instrument) {
                if attributes.instrument.is_some() {
                    return Err(input.error("`instrument` given more than once"));
                }
                input.parse::<keywords::instrument>()?;
                let fields = if input.peek(syn::token::Paren) {
                    let content;
                    syn::parenthesized!(content in input);
                    content.parse()?
                } else {
                    TokenStream::new()
                };
                attributes.instrument = Some(fields);
            } else if lookahead.peek(syn::Token![,]) {
                input.parse::<syn::Token![,]>()?;
            } else {
                attributes.unrecognised.push(lookahead.error());
                input.parse::<proc_macro2::TokenTree>()?;
            }
        }

        Ok(attributes)
    }
}

/// Wrap a function with `trace` events on entry and exit.
///
/// `instrument(...)` forwards its arguments to `#[tracing::instrument]`, and
/// `timing(precision = "ms")` appends the elapsed time to the exit event.
/// Works for both sync and `async` functions: the guard lives in the body, so
/// for futures the timing covers first poll to completion.
///
/// The expansion refers to `tracing` by path, so the calling crate must
/// depend on it directly.
#[proc_macro_attribute]
pub fn traced(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    let args = parse_macro_input!(args as Attributes);
    let mut item_fn = parse_macro_input!(item as ItemFn);

    let warnings = args.warnings();
    let name = item_fn.sig.ident.to_string();

    item_fn
        .attrs
        .push(parse_quote!(#[allow(clippy::items_after_statements)]));
    if let Some(fields) = &args.instrument {
        item_fn
            .attrs
            .push(parse_quote!(#[tracing::instrument(#fields)]));
    }

    let on_exit: Stmt = match args.timing {
        Some(precision) => {
            let render = precision.render();
            parse_quote! {
                {
                    let elapsed = self.started.elapsed();
                    tracing::trace!(elapsed = %#render, "exit {}", #name);
                }
            }
        }
        None => parse_quote! { tracing::trace!("exit {}", #name); },
    };

    let prologue: Vec<Stmt> = parse_quote! {
        #[allow(dead_code)]
        struct __TracedGuard {
            started: std::time::Instant,
        }

        impl std::ops::Drop for __TracedGuard {
            fn drop(&mut self) {
                #on_exit
            }
        }

        #warnings
        tracing::trace!("enter {}", #name);
        let __traced_guard = __TracedGuard {
            started: std::time::Instant::now(),
        };
    };

    let body = std::mem::take(&mut item_fn.block.stmts);
    item_fn.block.stmts = prologue.into_iter().chain(body).collect();

    quote!(#item_fn).into()
}
