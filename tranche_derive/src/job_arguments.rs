//! Derive macro mapping struct fields to positional job arguments.

use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Fields, Member};

struct ArgumentField {
    member: Member,
    default: bool,
}

/// Implementation of the `JobArguments` derive macro.
///
/// Fields map to job arguments in declaration order. Trailing fields marked
/// `#[job_argument(default)]` may be missing from the argument list and fall back to
/// `Default::default()`.
pub fn job_arguments_impl(item: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let item_tokens: TokenStream = item.into();
    let input = match syn::parse2::<DeriveInput>(item_tokens) {
        Ok(tree) => tree,
        Err(e) => return e.to_compile_error().into(),
    };

    match expand(&input) {
        Ok(tokens) => tokens.into(),
        Err(e) => e.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream> {
    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new_spanned(
            input,
            "JobArguments can only be derived for structs",
        ));
    };

    let mut fields = Vec::new();
    for (index, field) in data.fields.iter().enumerate() {
        let mut default = false;
        for attr in &field.attrs {
            if attr.path().is_ident("job_argument") {
                attr.parse_nested_meta(|meta| {
                    if meta.path.is_ident("default") {
                        default = true;
                        Ok(())
                    } else {
                        Err(meta.error("expected `default`"))
                    }
                })?;
            }
        }
        let member = match &field.ident {
            Some(ident) => Member::Named(ident.clone()),
            None => Member::Unnamed(index.into()),
        };
        if !default && fields.iter().any(|f: &ArgumentField| f.default) {
            return Err(syn::Error::new_spanned(
                field,
                "fields after a `#[job_argument(default)]` field must also be `#[job_argument(default)]`",
            ));
        }
        fields.push(ArgumentField { member, default });
    }

    let name = &input.ident;
    let (impl_generics, type_generics, where_clause) = input.generics.split_for_impl();
    let total = fields.len();
    let required = fields.iter().filter(|field| !field.default).count();

    let encode = fields.iter().enumerate().map(|(index, field)| {
        let member = &field.member;
        quote! {
            arguments.push(
                ::tranche_core::serde_json::to_value(&self.#member).map_err(|source| {
                    ::tranche_core::JobArgumentsError::Encode { index: #index, source }
                })?,
            );
        }
    });

    let decode_bindings: Vec<_> = (0..total).map(|index| format_ident!("argument_{}", index)).collect();
    let decode = fields.iter().enumerate().map(|(index, field)| {
        let binding = &decode_bindings[index];
        let from_value = quote! {
            ::tranche_core::serde_json::from_value(value.clone()).map_err(|source| {
                ::tranche_core::JobArgumentsError::Decode { index: #index, source }
            })?
        };
        if field.default {
            quote! {
                let #binding = match arguments.get(#index) {
                    Some(value) => #from_value,
                    None => ::core::default::Default::default(),
                };
            }
        } else {
            quote! {
                let #binding = {
                    let value = &arguments[#index];
                    #from_value
                };
            }
        }
    });

    let construct = match &data.fields {
        Fields::Named(_) => {
            let assignments = fields.iter().zip(&decode_bindings).map(|(field, binding)| {
                let member = &field.member;
                quote! { #member: #binding }
            });
            quote! { Self { #(#assignments),* } }
        }
        Fields::Unnamed(_) => quote! { Self( #(#decode_bindings),* ) },
        Fields::Unit => quote! { Self },
    };

    Ok(quote! {
        impl #impl_generics ::tranche_core::JobArguments for #name #type_generics #where_clause {
            fn to_job_arguments(
                &self,
            ) -> ::core::result::Result<
                ::std::vec::Vec<::tranche_core::serde_json::Value>,
                ::tranche_core::JobArgumentsError,
            > {
                #[allow(unused_mut)]
                let mut arguments = ::std::vec::Vec::with_capacity(#total);
                #(#encode)*
                ::core::result::Result::Ok(arguments)
            }

            fn from_job_arguments(
                arguments: &[::tranche_core::serde_json::Value],
            ) -> ::core::result::Result<Self, ::tranche_core::JobArgumentsError> {
                ::tranche_core::JobArgumentsError::check_count(#required, #total, arguments.len())?;
                #(#decode)*
                ::core::result::Result::Ok(#construct)
            }
        }
    })
}
