//! Derive macros for the trellis framework.
//!
//! These are re-exported through `trellis::prelude` when the `derive` feature
//! is enabled; nothing here is intended to be used directly.
#![recursion_limit = "256"]

extern crate proc_macro;

mod bind;
mod state;

/// Derives `trellis::binder::Bind` for a request struct, reading per-field
/// `#[bind(...)]` attributes to build the binding descriptor.
///
/// ```ignore
/// #[derive(Deserialize, Bind)]
/// struct ListPosts {
///     #[bind(path)]
///     user_id: u64,
///     #[bind(query, rename = "limit")]
///     limit: Option<i32>,
///     #[bind(header, rename = "x-api-key")]
///     api_key: Option<String>,
/// }
/// ```
#[proc_macro_derive(Bind, attributes(bind))]
pub fn bind(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let ast = syn::parse_macro_input!(input as syn::DeriveInput);
    bind::expand(&ast)
        .unwrap_or_else(|err| err.to_compile_error())
        .into()
}

/// Derives `trellis::state::StateData` so a type can be stored in `State`.
#[proc_macro_derive(StateData)]
pub fn state_data(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let ast = syn::parse_macro_input!(input as syn::DeriveInput);
    state::state_data(&ast).into()
}
