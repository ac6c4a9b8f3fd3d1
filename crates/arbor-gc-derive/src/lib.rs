//! Derive macro for the `arbor_gc::Trace` trait.
//!
//! The generated impl forwards to every field in declaration order.
//! Fields annotated with `#[arbor_gc(skip)]` are not traced; they must not
//! hold heap references. `#[arbor_gc(crate = path)]` on the type overrides
//! the path of the runtime crate.

use proc_macro2::TokenStream;
use quote::{format_ident, quote, quote_spanned};
use syn::{
    parse_macro_input, parse_quote, spanned::Spanned, Attribute, Data, DeriveInput, Field, Fields,
    GenericParam, Generics, Ident, Index, Path,
};

#[proc_macro_derive(Trace, attributes(arbor_gc))]
pub fn derive_trace(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let mut arbor_gc: Path = parse_quote!(::arbor_gc);

    for attr in &input.attrs {
        if !attr.path().is_ident("arbor_gc") {
            continue;
        }

        let result = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("crate") {
                arbor_gc = meta.value()?.parse()?;
                Ok(())
            } else {
                Err(meta.error("unsupported attribute"))
            }
        });

        if let Err(err) = result {
            return err.into_compile_error().into();
        }
    }

    let name = &input.ident;
    let generics = add_trait_bounds(&arbor_gc, input.generics);
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();
    let trace_body = match generate_trace_body(&arbor_gc, name, &input.data) {
        Ok(body) => body,
        Err(err) => return err.into_compile_error().into(),
    };

    let generated = quote! {
        unsafe impl #impl_generics #arbor_gc::Trace for #name #ty_generics #where_clause {
            #[inline]
            #[allow(unused_variables)]
            fn trace(&self, visitor: &mut #arbor_gc::Visitor<'_>) {
                #trace_body
            }
        }
    };

    generated.into()
}

fn add_trait_bounds(arbor_gc: &Path, mut generics: Generics) -> Generics {
    for param in &mut generics.params {
        if let GenericParam::Type(ref mut type_param) = *param {
            let has_trace = type_param.bounds.iter().any(|b| {
                if let syn::TypeParamBound::Trait(t) = b {
                    t.path.segments.last().is_some_and(|s| s.ident == "Trace")
                } else {
                    false
                }
            });
            if !has_trace {
                type_param.bounds.push(parse_quote!(#arbor_gc::Trace));
            }
        }
    }
    generics
}

/// Whether the field carries `#[arbor_gc(skip)]`.
fn is_skipped(attrs: &[Attribute]) -> syn::Result<bool> {
    let mut skip = false;
    for attr in attrs {
        if !attr.path().is_ident("arbor_gc") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("skip") {
                skip = true;
                Ok(())
            } else {
                Err(meta.error("unsupported field attribute"))
            }
        })?;
    }
    Ok(skip)
}

fn traced_fields<'a>(
    fields: impl IntoIterator<Item = &'a Field>,
) -> syn::Result<Vec<(usize, &'a Field)>> {
    let mut traced = Vec::new();
    for (i, field) in fields.into_iter().enumerate() {
        if !is_skipped(&field.attrs)? {
            traced.push((i, field));
        }
    }
    Ok(traced)
}

fn generate_trace_body(arbor_gc: &Path, name: &Ident, data: &Data) -> syn::Result<TokenStream> {
    match data {
        Data::Struct(data) => generate_struct_trace(arbor_gc, &data.fields),
        Data::Enum(data) => generate_enum_trace(arbor_gc, name, data),
        Data::Union(u) => Err(syn::Error::new(
            u.union_token.span,
            "`Trace` must be manually implemented for unions",
        )),
    }
}

fn generate_struct_trace(arbor_gc: &Path, fields: &Fields) -> syn::Result<TokenStream> {
    let trace_calls = traced_fields(fields)?
        .into_iter()
        .map(|(i, field)| {
            let member = field.ident.as_ref().map_or_else(
                || {
                    let index = Index::from(i);
                    quote!(#index)
                },
                |ident| quote!(#ident),
            );
            quote_spanned! {field.span() =>
                #arbor_gc::Trace::trace(&self.#member, visitor);
            }
        })
        .collect::<Vec<_>>();
    Ok(quote! { #(#trace_calls)* })
}

fn generate_enum_trace(
    arbor_gc: &Path,
    name: &Ident,
    data: &syn::DataEnum,
) -> syn::Result<TokenStream> {
    let mut match_arms = Vec::new();
    for variant in &data.variants {
        let var_name = &variant.ident;
        let traced = traced_fields(&variant.fields)?;
        let bindings: Vec<_> = traced
            .iter()
            .map(|(i, _)| format_ident!("field{}", i))
            .collect();
        let trace_calls = bindings.iter().map(|binding| {
            quote! { #arbor_gc::Trace::trace(#binding, visitor); }
        });
        let arm = match &variant.fields {
            Fields::Named(_) => {
                let names = traced.iter().filter_map(|(_, field)| field.ident.as_ref());
                quote! {
                    #name::#var_name { #(#names: #bindings,)* .. } => {
                        #(#trace_calls)*
                    }
                }
            }
            Fields::Unnamed(f) => {
                let patterns = (0..f.unnamed.len()).map(|i| {
                    if traced.iter().any(|(traced_index, _)| *traced_index == i) {
                        let binding = format_ident!("field{}", i);
                        quote!(#binding)
                    } else {
                        quote!(_)
                    }
                });
                quote! {
                    #name::#var_name(#(#patterns),*) => {
                        #(#trace_calls)*
                    }
                }
            }
            Fields::Unit => quote! {
                #name::#var_name => {}
            },
        };
        match_arms.push(arm);
    }

    if match_arms.is_empty() {
        return Ok(quote! {});
    }
    Ok(quote! {
        match self {
            #(#match_arms)*
        }
    })
}
