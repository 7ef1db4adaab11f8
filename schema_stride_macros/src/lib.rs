//! Procedural macros for schema_stride
//!
//! `#[derive(Model)]` implements `schema_stride::models::Model` and checks the
//! `#[stride(...)]` attributes that the model scanner later reads from source.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::meta::ParseNestedMeta;
use syn::{parse_macro_input, Data, DeriveInput, Fields};

const MODEL_KEYS: &[&str] = &["table", "index", "unique_together"];

/// Keys taking a value; everything else in `FLAG_KEYS` may stand alone
const FIELD_VALUE_KEYS: &[&str] = &[
    "max_length",
    "max_digits",
    "decimal_places",
    "db_column",
    "default",
    "default_fn",
    "db_default",
    "kind",
    "foreign_key",
    "one_to_one",
    "to_field",
    "on_delete",
    "many_to_many",
    "reverse",
];

const FLAG_KEYS: &[&str] = &[
    "primary_key",
    "generated",
    "null",
    "unique",
    "index",
    "auto_now",
    "auto_now_add",
    "skip",
];

/// Derive macro for schema_stride models
#[proc_macro_derive(Model, attributes(stride))]
pub fn derive_model(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand_model(&input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand_model(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            _ => {
                return Err(syn::Error::new_spanned(
                    name,
                    "Model can only be derived for structs with named fields",
                ))
            }
        },
        _ => return Err(syn::Error::new_spanned(name, "Model can only be derived for structs")),
    };

    let mut table = None;
    for attr in input.attrs.iter().filter(|a| a.path().is_ident("stride")) {
        attr.parse_nested_meta(|meta| {
            let key = key_of(&meta, MODEL_KEYS)?;
            let value: syn::LitStr = meta.value()?.parse()?;
            if key == "table" {
                table = Some(value.value());
            }
            Ok(())
        })?;
    }

    for field in fields {
        for attr in field.attrs.iter().filter(|a| a.path().is_ident("stride")) {
            attr.parse_nested_meta(|meta| {
                let key = meta
                    .path
                    .get_ident()
                    .map(|i| i.to_string())
                    .unwrap_or_default();
                if FLAG_KEYS.contains(&key.as_str()) {
                    if meta.input.peek(syn::Token![=]) {
                        meta.value()?.parse::<syn::LitBool>()?;
                    }
                    Ok(())
                } else if FIELD_VALUE_KEYS.contains(&key.as_str()) {
                    meta.value()?.parse::<syn::Expr>()?;
                    Ok(())
                } else {
                    Err(meta.error(format!("unknown stride field attribute `{}`", key)))
                }
            })?;
        }
    }

    let model_name = name.to_string();
    let table = table.unwrap_or_else(|| snake_case(&model_name));

    Ok(quote! {
        #[automatically_derived]
        impl #impl_generics ::schema_stride::models::Model for #name #ty_generics #where_clause {
            const MODEL_NAME: &'static str = #model_name;

            fn db_table() -> ::std::string::String {
                ::std::string::String::from(#table)
            }
        }
    })
}

fn key_of(meta: &ParseNestedMeta, allowed: &[&str]) -> syn::Result<String> {
    let key = meta
        .path
        .get_ident()
        .map(|i| i.to_string())
        .unwrap_or_default();
    if allowed.contains(&key.as_str()) {
        Ok(key)
    } else {
        Err(meta.error(format!("unknown stride model attribute `{}`", key)))
    }
}

/// `BlogPost` to `blog_post`, `HTTPRequest` to `http_request`
fn snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            let prev_lower = i > 0 && (chars[i - 1].is_lowercase() || chars[i - 1].is_ascii_digit());
            let next_lower = chars.get(i + 1).map_or(false, |n| n.is_lowercase());
            if i > 0 && (prev_lower || (next_lower && chars[i - 1].is_uppercase())) {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(*c);
        }
    }
    out
}
