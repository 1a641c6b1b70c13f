use proc_macro::TokenStream;

use quote::{format_ident, quote};
use syn::{
    Attribute, Expr, ExprArray, ExprLit, ExprPath, Fields, ItemStruct, Lit, Meta, Token,
    parse::Parser, spanned::Spanned,
};

/// Marks a struct as a task kind.
///
/// `#[Task(kind = "file", label = "File", describe = "path")]` generates the
/// `KIND`/`LABEL` constants, a `default_description()` built from the named
/// field, and `from_decl()`, which deserializes a declaration's attributes,
/// calls the struct's own `validate(&self) -> crate::Result<()>` and boxes the
/// task for the planner.
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Task(attr: TokenStream, item: TokenStream) -> TokenStream {
    match task_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

/// Groups task kinds so they can be registered together:
/// `#[Catalog(id = "nodetasks", tasks = [File, LoadImage])]`.
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Catalog(attr: TokenStream, item: TokenStream) -> TokenStream {
    match catalog_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

fn lit_str(expr: &Expr) -> syn::Result<String> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Str(s), ..
        }) => Ok(s.value()),
        _ => Err(syn::Error::new(expr.span(), "expected string literal")),
    }
}

fn expr_array_paths(expr: &Expr) -> syn::Result<Vec<syn::Path>> {
    let Expr::Array(ExprArray { elems, .. }) = expr else {
        return Err(syn::Error::new(expr.span(), "expected array literal"));
    };
    let mut out = Vec::new();
    for e in elems {
        match e {
            Expr::Path(ExprPath { path, .. }) => out.push(path.clone()),
            _ => return Err(syn::Error::new(e.span(), "expected path (identifier)")),
        }
    }
    Ok(out)
}

fn drop_our_attrs(attrs: &[Attribute]) -> Vec<Attribute> {
    attrs
        .iter()
        .filter(|a| {
            let Meta::Path(p) = &a.meta else {
                return true;
            };
            let Some(ident) = p.get_ident() else {
                return true;
            };
            ident != "Task" && ident != "Catalog"
        })
        .cloned()
        .collect()
}

fn parse_pairs(attr: TokenStream) -> syn::Result<Vec<(String, Expr, proc_macro2::Span)>> {
    let parser = syn::punctuated::Punctuated::<Meta, Token![,]>::parse_terminated;
    let metas = parser.parse(attr)?;
    let mut out = Vec::new();
    for m in metas {
        let Meta::NameValue(nv) = m else {
            return Err(syn::Error::new(m.span(), "expected key = value"));
        };
        let Some(key) = nv.path.get_ident().map(|i| i.to_string()) else {
            return Err(syn::Error::new(nv.path.span(), "expected ident key"));
        };
        out.push((key, nv.value, nv.path.span()));
    }
    Ok(out)
}

fn task_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = drop_our_attrs(&st.attrs);
    let struct_ident = st.ident.clone();

    let mut kind: Option<String> = None;
    let mut label: Option<String> = None;
    let mut describe: Option<String> = None;

    for (key, v, span) in parse_pairs(attr)? {
        match key.as_str() {
            "kind" => kind = Some(lit_str(&v)?),
            "label" => label = Some(lit_str(&v)?),
            "describe" => describe = Some(lit_str(&v)?),
            other => {
                return Err(syn::Error::new(
                    span,
                    format!("unknown Task attribute key '{other}'"),
                ));
            }
        }
    }

    let kind = kind.ok_or_else(|| syn::Error::new(struct_ident.span(), "Task: missing kind"))?;
    if kind.is_empty() || !kind.chars().all(|c| c.is_ascii_lowercase() || c == '_') {
        return Err(syn::Error::new(
            struct_ident.span(),
            "Task: kind must be lowercase snake_case",
        ));
    }
    let label = label.unwrap_or_else(|| struct_ident.to_string());
    let describe =
        describe.ok_or_else(|| syn::Error::new(struct_ident.span(), "Task: missing describe"))?;

    let Fields::Named(named) = &st.fields else {
        return Err(syn::Error::new(
            st.fields.span(),
            "Task: expected a struct with named fields",
        ));
    };
    if !named
        .named
        .iter()
        .any(|f| f.ident.as_ref().is_some_and(|i| *i == describe))
    {
        return Err(syn::Error::new(
            struct_ident.span(),
            format!("Task: describe field '{describe}' does not exist"),
        ));
    }
    let describe_ident = format_ident!("{}", describe);

    let expanded = quote! {
        #st

        impl #struct_ident {
            pub const KIND: &'static str = #kind;
            pub const LABEL: &'static str = #label;

            pub fn default_description(&self) -> String {
                format!("{}: {}", #label, self.#describe_ident)
            }

            pub fn from_decl(
                decl: &crate::planner::TaskDecl,
            ) -> crate::Result<std::sync::Arc<dyn crate::task::Reconcile>> {
                let task: Self = decl.attrs_as()?;
                // Tasks validate their own attributes by implementing:
                // `fn validate(&self) -> crate::Result<()>`
                task.validate().map_err(|e| {
                    crate::Error::config(format!("task '{}' ({}): {e}", decl.id, #kind))
                })?;
                Ok(std::sync::Arc::new(task))
            }
        }
    };

    Ok(expanded.into())
}

fn catalog_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = drop_our_attrs(&st.attrs);
    let struct_ident = st.ident.clone();

    let mut id: Option<String> = None;
    let mut tasks: Option<Vec<syn::Path>> = None;

    for (key, v, span) in parse_pairs(attr)? {
        match key.as_str() {
            "id" => id = Some(lit_str(&v)?),
            "tasks" => tasks = Some(expr_array_paths(&v)?),
            other => {
                return Err(syn::Error::new(
                    span,
                    format!("unknown Catalog attribute key '{other}'"),
                ));
            }
        }
    }

    let id = id.ok_or_else(|| syn::Error::new(struct_ident.span(), "Catalog: missing id"))?;
    let tasks =
        tasks.ok_or_else(|| syn::Error::new(struct_ident.span(), "Catalog: missing tasks"))?;

    let reg_tasks = tasks
        .iter()
        .map(|p| quote! { reg.add(#p::KIND, #p::from_decl)?; });
    let kinds = tasks.iter().map(|p| quote! { #p::KIND });

    let expanded = quote! {
        #st

        impl crate::task::Catalog for #struct_ident {
            fn id(&self) -> &'static str {
                #id
            }

            fn kinds(&self) -> Vec<&'static str> {
                vec![#(#kinds),*]
            }

            fn register_tasks(&self, reg: &mut crate::task::TaskRegistry) -> crate::Result<()> {
                #(#reg_tasks)*
                Ok(())
            }
        }
    };

    Ok(expanded.into())
}
