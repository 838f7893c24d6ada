//! Derive macro for naming batch jobs.

use proc_macro2::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, LitStr};

/// Implementation of the `JobClassName` derive macro.
///
/// # Attributes
///
/// - `#[job_class_name("CustomName")]` - Use a custom name instead of the type name.
/// - `#[job_class_name(namespace = "Backfills")]` - Prefix the name: `Backfills::MyJob`.
/// - `#[job_class_name(name = "CustomName", namespace = "Backfills")]` - Both.
pub fn job_class_name_impl(item: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let item_tokens: TokenStream = item.into();
    let input = match syn::parse2::<DeriveInput>(item_tokens) {
        Ok(tree) => tree,
        Err(e) => return e.to_compile_error().into(),
    };

    if let Data::Union(_) = &input.data {
        return syn::Error::new_spanned(&input, "JobClassName cannot be derived for unions")
            .to_compile_error()
            .into();
    }

    let type_name = &input.ident;
    let (impl_generics, type_generics, where_clause) = input.generics.split_for_impl();

    let mut custom_name: Option<String> = None;
    let mut namespace: Option<String> = None;

    for attr in &input.attrs {
        if attr.path().is_ident("job_class_name") {
            if let Ok(lit) = attr.parse_args::<LitStr>() {
                custom_name = Some(lit.value());
                continue;
            }

            let result = attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("name") {
                    let value: LitStr = meta.value()?.parse()?;
                    custom_name = Some(value.value());
                    Ok(())
                } else if meta.path.is_ident("namespace") {
                    let value: LitStr = meta.value()?.parse()?;
                    namespace = Some(value.value());
                    Ok(())
                } else {
                    Err(meta.error("expected `name` or `namespace`"))
                }
            });

            if let Err(e) = result {
                return e.to_compile_error().into();
            }
        }
    }

    let name = custom_name.unwrap_or_else(|| type_name.to_string());
    let job_class_name = qualified_name(namespace.as_deref(), &name);

    if job_class_name.is_empty() {
        return syn::Error::new_spanned(&input, "job class name cannot be empty")
            .to_compile_error()
            .into();
    }

    let expanded = quote! {
        impl #impl_generics ::tranche_core::JobClassName for #type_name #type_generics #where_clause {
            fn job_class_name(&self) -> &str {
                #job_class_name
            }
        }
    };

    expanded.into()
}

/// Joins a namespace and a name with `::`, dropping leading separators.
fn qualified_name(namespace: Option<&str>, name: &str) -> String {
    let name = name.trim().trim_start_matches("::");
    match namespace
        .map(|namespace| namespace.trim().trim_matches(':'))
        .filter(|namespace| !namespace.is_empty())
    {
        Some(namespace) => format!("{namespace}::{name}"),
        None => name.to_string(),
    }
}
