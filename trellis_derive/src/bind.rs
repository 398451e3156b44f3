use proc_macro2::TokenStream;
use quote::quote;
use syn::spanned::Spanned;
use syn::{Data, DeriveInput, Error, Fields, LitStr, Type};

enum Source {
    Path,
    Query,
    Header,
    Body,
}

impl Source {
    fn tokens(&self) -> TokenStream {
        match self {
            Source::Path => quote!(::trellis::binder::FieldSource::Path),
            Source::Query => quote!(::trellis::binder::FieldSource::Query),
            Source::Header => quote!(::trellis::binder::FieldSource::Header),
            Source::Body => quote!(::trellis::binder::FieldSource::Body),
        }
    }
}

pub(crate) fn expand(ast: &DeriveInput) -> Result<TokenStream, Error> {
    let name = &ast.ident;

    if !ast.generics.params.is_empty() {
        return Err(Error::new(
            ast.generics.span(),
            "#[derive(Bind)] does not support generic request types",
        ));
    }

    let fields = match &ast.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(named) => &named.named,
            _ => {
                return Err(Error::new(
                    ast.span(),
                    "#[derive(Bind)] requires a struct with named fields",
                ))
            }
        },
        _ => {
            return Err(Error::new(
                ast.span(),
                "#[derive(Bind)] may only be applied to structs",
            ))
        }
    };

    let mut specs = Vec::new();
    for field in fields {
        let ident = field.ident.as_ref().expect("named field");
        let field_name = ident.to_string();

        let attr = match field.attrs.iter().find(|a| a.path().is_ident("bind")) {
            Some(attr) => attr,
            // Fields without a binding source are left to serde defaults.
            None => continue,
        };

        let mut source: Option<Source> = None;
        let mut rename: Option<String> = None;

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("path") {
                source = Some(Source::Path);
            } else if meta.path.is_ident("query") {
                source = Some(Source::Query);
            } else if meta.path.is_ident("header") {
                source = Some(Source::Header);
            } else if meta.path.is_ident("body") {
                source = Some(Source::Body);
            } else if meta.path.is_ident("rename") {
                let lit: LitStr = meta.value()?.parse()?;
                rename = Some(lit.value());
            } else {
                return Err(meta.error("expected `path`, `query`, `header`, `body` or `rename`"));
            }
            Ok(())
        })?;

        let source = source.ok_or_else(|| {
            Error::new(
                attr.span(),
                "#[bind(...)] must name a source: path, query, header or body",
            )
        })?;

        let external = rename.unwrap_or_else(|| field_name.clone());
        let source_tokens = source.tokens();
        let kind = kind_of(&field.ty, &source);

        specs.push(quote! {
            ::trellis::binder::FieldSpec::new(#field_name, #external, #source_tokens, #kind)
        });
    }

    let type_name = name.to_string();

    Ok(quote! {
        impl ::trellis::binder::Bind for #name {
            fn type_name() -> &'static str {
                #type_name
            }

            fn field_specs() -> ::std::vec::Vec<::trellis::binder::FieldSpec> {
                ::std::vec![#(#specs),*]
            }
        }
    })
}

/// Maps the field's Rust type onto a `FieldKind`, syntactically. `Option` and
/// `Vec` recurse into their first type argument; unrecognized types decode as
/// raw strings (or as unchecked JSON when sourced from the body).
fn kind_of(ty: &Type, source: &Source) -> TokenStream {
    if let Type::Path(type_path) = ty {
        if let Some(segment) = type_path.path.segments.last() {
            let ident = segment.ident.to_string();
            match ident.as_str() {
                "Option" | "Vec" => {
                    if let syn::PathArguments::AngleBracketed(args) = &segment.arguments {
                        if let Some(syn::GenericArgument::Type(inner)) = args.args.first() {
                            let inner = kind_of(inner, source);
                            return if ident == "Option" {
                                quote!(::trellis::binder::FieldKind::Optional(
                                    ::std::boxed::Box::new(#inner)
                                ))
                            } else {
                                quote!(::trellis::binder::FieldKind::Sequence(
                                    ::std::boxed::Box::new(#inner)
                                ))
                            };
                        }
                    }
                }
                "bool" => return quote!(::trellis::binder::FieldKind::Bool),
                "i8" => return int(quote!(W8)),
                "i16" => return int(quote!(W16)),
                "i32" => return int(quote!(W32)),
                "i64" | "isize" => return int(quote!(W64)),
                "u8" => return uint(quote!(W8)),
                "u16" => return uint(quote!(W16)),
                "u32" => return uint(quote!(W32)),
                "u64" | "usize" => return uint(quote!(W64)),
                "f32" | "f64" => return quote!(::trellis::binder::FieldKind::Float),
                "String" => return quote!(::trellis::binder::FieldKind::String),
                "OffsetDateTime" => return quote!(::trellis::binder::FieldKind::Instant),
                _ => {}
            }
        }
    }

    match source {
        Source::Body => quote!(::trellis::binder::FieldKind::Json),
        _ => quote!(::trellis::binder::FieldKind::String),
    }
}

fn int(width: TokenStream) -> TokenStream {
    quote!(::trellis::binder::FieldKind::Int(
        ::trellis::binder::IntWidth::#width
    ))
}

fn uint(width: TokenStream) -> TokenStream {
    quote!(::trellis::binder::FieldKind::Uint(
        ::trellis::binder::IntWidth::#width
    ))
}
