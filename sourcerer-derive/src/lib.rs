//! Derive macros for the `sourcerer` event-sourcing framework.
use proc_macro::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields, parse_macro_input};

/// Derives the `Event` trait for an enum.
///
/// This macro automatically implements the `event_type` method, which returns
/// a string slice representing the variant's name.
#[proc_macro_derive(Event)]
pub fn event_derive(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;

    let variants = match &input.data {
        Data::Enum(data) => &data.variants,
        _ => panic!("Event derive macro can only be used on enums"),
    };

    let event_type_arms = variants.iter().map(|variant| {
        let variant_name = &variant.ident;
        let fields = match &variant.fields {
            Fields::Named(_) => quote! { { .. } },
            Fields::Unnamed(_) => quote! { (..) },
            Fields::Unit => quote! {},
        };
        quote! {
            #name::#variant_name #fields => stringify!(#variant_name)
        }
    });

    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let expanded = quote! {
        impl #impl_generics sourcerer::Event for #name #ty_generics #where_clause {
            fn event_type(&self) -> &'static str {
                match self {
                    #(#event_type_arms),*
                }
            }
        }
    };

    TokenStream::from(expanded)
}

/// Derives the `CommandType` trait, implementing `command_type` to return
/// the command's own name.
///
/// Works on both structs (the common case — one type per command, e.g.
/// `CreatePlayer`) and enums (`command_type` matches on the variant name,
/// the same way `#[derive(Event)]` does).
#[proc_macro_derive(Command)]
pub fn command_derive(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let body = match &input.data {
        Data::Enum(data) => {
            let arms = data.variants.iter().map(|variant| {
                let variant_name = &variant.ident;
                let fields = match &variant.fields {
                    Fields::Named(_) => quote! { { .. } },
                    Fields::Unnamed(_) => quote! { (..) },
                    Fields::Unit => quote! {},
                };
                quote! {
                    #name::#variant_name #fields => stringify!(#variant_name)
                }
            });
            quote! {
                match self {
                    #(#arms),*
                }
            }
        }
        Data::Struct(_) => quote! { stringify!(#name) },
        Data::Union(_) => panic!("Command derive macro cannot be used on unions"),
    };

    let expanded = quote! {
        impl #impl_generics sourcerer::CommandType for #name #ty_generics #where_clause {
            fn command_type(&self) -> &'static str {
                #body
            }
        }
    };

    TokenStream::from(expanded)
}
