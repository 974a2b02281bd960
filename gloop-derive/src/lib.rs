//! `#[derive(SharedMemorySafe)]` for types mapped into gloop shared memory.

use proc_macro::TokenStream;
use proc_macro_crate::{FoundCrate, crate_name};
use proc_macro2::Span;
use quote::quote;
use syn::spanned::Spanned;
use syn::{
    Data, DeriveInput, Error, Fields, GenericArgument, Ident, PathArguments, Type,
    parse_macro_input, parse_quote,
};

/// Implements `gloop::SharedMemorySafe` after checking the layout at compile time.
///
/// The item must carry `#[repr(C)]`, `#[repr(transparent)]` or an integer
/// repr, and no field may hold a pointer, a heap allocation or a
/// process-local lock. Every field type must itself be `SharedMemorySafe`;
/// that part is enforced by the generated where clause.
///
/// ```compile_fail
/// # use gloop::SharedMemorySafe;
/// #[derive(SharedMemorySafe)]
/// struct NoRepr {
///     word: u32,
/// }
/// ```
///
/// ```compile_fail
/// # use gloop::SharedMemorySafe;
/// #[derive(SharedMemorySafe)]
/// #[repr(C)]
/// struct Boxed {
///     word: Box<u32>,
/// }
/// ```
#[proc_macro_derive(SharedMemorySafe)]
pub fn derive_shared_memory_safe(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(&input)
        .unwrap_or_else(Error::into_compile_error)
        .into()
}

fn expand(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    require_stable_repr(input)?;
    let fields = field_types(&input.data)?;
    for ty in &fields {
        reject_pointers(ty, ty)?;
    }

    let krate = gloop_path();
    let name = &input.ident;
    let mut generics = input.generics.clone();
    let where_clause = generics.make_where_clause();
    for ty in &fields {
        where_clause
            .predicates
            .push(parse_quote!(#ty: #krate::__SharedMemorySafePrivate));
    }
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    Ok(quote! {
        unsafe impl #impl_generics #krate::__SharedMemorySafePrivate
            for #name #ty_generics #where_clause {}
    })
}

/// Resolves the path of the runtime crate, which may be renamed by the user.
fn gloop_path() -> proc_macro2::TokenStream {
    match crate_name("gloop") {
        Ok(FoundCrate::Name(name)) => {
            let ident = Ident::new(&name, Span::call_site());
            quote!(::#ident)
        }
        Ok(FoundCrate::Itself) | Err(_) => quote!(::gloop),
    }
}

const STABLE_REPRS: &[&str] = &[
    "C",
    "transparent",
    "u8",
    "u16",
    "u32",
    "u64",
    "usize",
    "i8",
    "i16",
    "i32",
    "i64",
    "isize",
];

fn require_stable_repr(input: &DeriveInput) -> syn::Result<()> {
    let mut stable = false;
    for attr in input.attrs.iter().filter(|a| a.path().is_ident("repr")) {
        attr.parse_nested_meta(|meta| {
            if meta
                .path
                .get_ident()
                .is_some_and(|id| STABLE_REPRS.iter().any(|r| id == r))
            {
                stable = true;
            }
            // Skip the argument of align(N) / packed(N).
            if meta.input.peek(syn::token::Paren) {
                let _ = meta.input.parse::<proc_macro2::Group>()?;
            }
            Ok(())
        })?;
    }

    if stable {
        return Ok(());
    }
    let help = match input.data {
        Data::Enum(_) => "add #[repr(u32)] (or another integer repr) to the enum",
        _ => "add #[repr(C)] or #[repr(transparent)] to the item",
    };
    Err(Error::new(
        input.ident.span(),
        format!("SharedMemorySafe needs a stable layout\nhelp: {help}"),
    ))
}

fn field_types(data: &Data) -> syn::Result<Vec<Type>> {
    let of = |fields: &Fields| fields.iter().map(|f| f.ty.clone()).collect::<Vec<_>>();
    match data {
        Data::Struct(s) => Ok(of(&s.fields)),
        Data::Enum(e) => Ok(e.variants.iter().flat_map(|v| of(&v.fields)).collect()),
        Data::Union(u) => Err(Error::new(
            u.union_token.span,
            "SharedMemorySafe cannot be derived for unions",
        )),
    }
}

/// Types whose values point outside the mapping or only work inside one process.
const FORBIDDEN: &[(&str, &str)] = &[
    ("Vec", "owns a heap allocation; use an inline array"),
    ("Box", "owns a heap allocation; store the value inline"),
    ("String", "owns a heap allocation; use a fixed byte array"),
    ("PathBuf", "owns a heap allocation; use a fixed byte array"),
    ("OsString", "owns a heap allocation; use a fixed byte array"),
    ("CString", "owns a heap allocation; use a fixed byte array"),
    ("Rc", "is reference counted per process"),
    ("Arc", "is reference counted per process"),
    ("Mutex", "only synchronizes threads of one process; use atomics"),
    ("RwLock", "only synchronizes threads of one process; use atomics"),
    ("Condvar", "only synchronizes threads of one process; use atomics"),
    ("Barrier", "only synchronizes threads of one process; use atomics"),
];

fn reject_pointers(ty: &Type, field: &Type) -> syn::Result<()> {
    let pointer = |span: Span| {
        Error::new(
            span,
            format!(
                "field type `{}` holds an address, which is meaningless in another process",
                quote!(#field)
            ),
        )
    };

    match ty {
        Type::Reference(r) => Err(pointer(r.span())),
        Type::Ptr(p) => Err(pointer(p.span())),
        Type::Array(a) => reject_pointers(&a.elem, field),
        Type::Slice(s) => reject_pointers(&s.elem, field),
        Type::Group(g) => reject_pointers(&g.elem, field),
        Type::Paren(p) => reject_pointers(&p.elem, field),
        Type::Tuple(t) => t.elems.iter().try_for_each(|e| reject_pointers(e, field)),
        Type::Path(p) => {
            for segment in &p.path.segments {
                if let Some((name, why)) = FORBIDDEN.iter().find(|(n, _)| segment.ident == n) {
                    return Err(Error::new(
                        segment.ident.span(),
                        format!("field type `{}` contains `{name}`, which {why}", quote!(#field)),
                    ));
                }
                if let PathArguments::AngleBracketed(args) = &segment.arguments {
                    for arg in &args.args {
                        if let GenericArgument::Type(inner) = arg {
                            reject_pointers(inner, field)?;
                        }
                    }
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(ty: Type) -> syn::Result<()> {
        reject_pointers(&ty, &ty)
    }

    #[test]
    fn stable_reprs_are_accepted() {
        let inputs: [DeriveInput; 4] = [
            parse_quote! { #[repr(C)] struct A { x: u32 } },
            parse_quote! { #[repr(transparent)] struct B(u32); },
            parse_quote! { #[repr(u32)] enum C { X, Y } },
            parse_quote! { #[repr(C, align(64))] struct D { x: u64 } },
        ];
        for input in &inputs {
            assert!(require_stable_repr(input).is_ok(), "{}", input.ident);
        }
    }

    #[test]
    fn missing_or_unstable_repr_is_rejected() {
        let plain: DeriveInput = parse_quote! { struct A { x: u32 } };
        let packed_only: DeriveInput = parse_quote! { #[repr(align(8))] struct B { x: u32 } };
        assert!(require_stable_repr(&plain).is_err());
        assert!(require_stable_repr(&packed_only).is_err());
    }

    #[test]
    fn inline_data_passes() {
        assert!(check(parse_quote!(u64)).is_ok());
        assert!(check(parse_quote!(AtomicU32)).is_ok());
        assert!(check(parse_quote!([AtomicU8; 4032])).is_ok());
        assert!(check(parse_quote!(Option<u32>)).is_ok());
        assert!(check(parse_quote!((u32, i64))).is_ok());
    }

    #[test]
    fn addresses_are_rejected() {
        assert!(check(parse_quote!(&u32)).is_err());
        assert!(check(parse_quote!(&'static mut u32)).is_err());
        assert!(check(parse_quote!(*const u8)).is_err());
        assert!(check(parse_quote!(*mut u8)).is_err());
    }

    #[test]
    fn forbidden_types_are_found_at_any_depth() {
        assert!(check(parse_quote!(Vec<u8>)).is_err());
        assert!(check(parse_quote!(std::sync::Arc<u8>)).is_err());
        assert!(check(parse_quote!(Option<Box<u64>>)).is_err());
        assert!(check(parse_quote!([Mutex<u64>; 4])).is_err());
        assert!(check(parse_quote!((u32, String))).is_err());
        assert!(check(parse_quote!(Condvar)).is_err());
    }

    #[test]
    fn field_types_cover_all_shapes() {
        let named: DeriveInput = parse_quote! { struct A { x: u32, y: u64 } };
        let tuple: DeriveInput = parse_quote! { struct B(u32); };
        let unit: DeriveInput = parse_quote! { struct C; };
        let enumeration: DeriveInput = parse_quote! { enum D { X(u8), Y { z: u16 }, W } };
        let union: DeriveInput = parse_quote! { union E { x: u32, y: f32 } };

        assert_eq!(field_types(&named.data).map(|v| v.len()).ok(), Some(2));
        assert_eq!(field_types(&tuple.data).map(|v| v.len()).ok(), Some(1));
        assert_eq!(field_types(&unit.data).map(|v| v.len()).ok(), Some(0));
        assert_eq!(field_types(&enumeration.data).map(|v| v.len()).ok(), Some(2));
        assert!(field_types(&union.data).is_err());
    }

    #[test]
    fn expansion_bounds_every_field() {
        let input: DeriveInput = parse_quote! {
            #[repr(C)]
            struct Region { abort: AbortSignal, scratch: [u8; 16] }
        };
        let out = expand(&input).map(|t| t.to_string()).unwrap_or_default();
        assert!(out.contains("__SharedMemorySafePrivate"));
        assert!(out.contains("AbortSignal"));
        assert!(out.contains("[u8 ; 16]"));
    }
}
