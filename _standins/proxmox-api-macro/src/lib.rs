//! Stand-in for the proxmox `#[api]` attribute macro, covering only
//! what the metadump CLI uses: an `input` object schema with string,
//! boolean and pre-built (`schema: IDENT`) properties, mapped onto the
//! function arguments by name (`-` in the schema matching `_` in the
//! argument). An argument of type `Value` that matches no property
//! receives the whole parameter object.
//!
//! The expansion produces, next to the unchanged function `foo`:
//!
//! - `api_function_foo`, adapting JSON parameters to the typed call,
//! - `API_METHOD_FOO`, the method descriptor holding the input schema
//!   (built from the doc comment and the property definitions) and the
//!   handler.

use proc_macro2::{Span, TokenStream};
use quote::{format_ident, quote};
use syn::ext::IdentExt;
use syn::parse::{Parse, ParseStream};
use syn::spanned::Spanned;
use syn::{braced, Token};

#[proc_macro_attribute]
pub fn api(
    attr: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    match handle_api(attr.into(), item.into()) {
        Ok(output) => output.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

/// The schema-like attribute body: `key: value` pairs where a value is
/// either a braced object of further pairs or a Rust expression
/// (literal or schema path).
struct JsonObject {
    entries: Vec<JsonEntry>,
}

struct JsonEntry {
    key: String,
    span: Span,
    value: JsonValue,
}

enum JsonValue {
    Object(JsonObject),
    Expr(syn::Expr),
}

impl Parse for JsonObject {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut entries = Vec::new();
        while !input.is_empty() {
            let (key, span) = if input.peek(syn::LitStr) {
                let lit: syn::LitStr = input.parse()?;
                (lit.value(), lit.span())
            } else {
                let ident = syn::Ident::parse_any(input)?;
                (ident.to_string(), ident.span())
            };
            input.parse::<Token![:]>()?;
            let value = if input.peek(syn::token::Brace) {
                let content;
                braced!(content in input);
                JsonValue::Object(content.parse()?)
            } else {
                JsonValue::Expr(input.parse()?)
            };
            entries.push(JsonEntry { key, span, value });
            if input.is_empty() {
                break;
            }
            input.parse::<Token![,]>()?;
        }
        Ok(Self { entries })
    }
}

fn expect_object<'a>(value: &'a JsonValue, span: Span, what: &str) -> syn::Result<&'a JsonObject> {
    match value {
        JsonValue::Object(object) => Ok(object),
        JsonValue::Expr(_) => Err(syn::Error::new(span, format!("expected an object for '{}'", what))),
    }
}

fn expect_lit_str(value: &JsonValue, span: Span, what: &str) -> syn::Result<String> {
    if let JsonValue::Expr(syn::Expr::Lit(lit)) = value {
        if let syn::Lit::Str(text) = &lit.lit {
            return Ok(text.value());
        }
    }
    Err(syn::Error::new(span, format!("expected a string literal for '{}'", what)))
}

fn expect_lit_bool(value: &JsonValue, span: Span, what: &str) -> syn::Result<bool> {
    if let JsonValue::Expr(syn::Expr::Lit(lit)) = value {
        if let syn::Lit::Bool(flag) = &lit.lit {
            return Ok(flag.value());
        }
    }
    Err(syn::Error::new(span, format!("expected a boolean literal for '{}'", what)))
}

fn expect_expr(value: &JsonValue, span: Span, what: &str) -> syn::Result<syn::Expr> {
    match value {
        JsonValue::Expr(expr) => Ok(expr.clone()),
        JsonValue::Object(_) => Err(syn::Error::new(span, format!("expected an expression for '{}'", what))),
    }
}

/// One input property as written in the attribute.
struct Property {
    name: String,
    span: Span,
    description: Option<String>,
    optional: bool,
    default: Option<syn::Expr>,
    schema: Option<syn::Expr>,
}

fn parse_property(entry: &JsonEntry) -> syn::Result<Property> {
    let object = expect_object(&entry.value, entry.span, &entry.key)?;
    let mut property = Property {
        name: entry.key.clone(),
        span: entry.span,
        description: None,
        optional: false,
        default: None,
        schema: None,
    };
    for item in &object.entries {
        match item.key.as_str() {
            "description" => {
                property.description = Some(expect_lit_str(&item.value, item.span, "description")?);
            }
            "optional" => {
                property.optional = expect_lit_bool(&item.value, item.span, "optional")?;
            }
            "default" => {
                property.default = Some(expect_expr(&item.value, item.span, "default")?);
            }
            "schema" => {
                property.schema = Some(expect_expr(&item.value, item.span, "schema")?);
            }
            other => {
                return Err(syn::Error::new(
                    item.span,
                    format!("unsupported property attribute '{}'", other),
                ));
            }
        }
    }
    Ok(property)
}

fn get_doc_comment(attrs: &[syn::Attribute]) -> String {
    let mut lines = Vec::new();
    for attr in attrs {
        if attr.path().is_ident("doc") {
            if let syn::Meta::NameValue(pair) = &attr.meta {
                if let syn::Expr::Lit(lit) = &pair.value {
                    if let syn::Lit::Str(text) = &lit.lit {
                        lines.push(text.value().trim().to_string());
                    }
                }
            }
        }
    }
    lines.join("\n")
}

fn type_name(ty: &syn::Type) -> Option<String> {
    if let syn::Type::Path(path) = ty {
        path.path.segments.last().map(|segment| segment.ident.to_string())
    } else {
        None
    }
}

const INTEGER_TYPES: &[&str] = &[
    "i8", "i16", "i32", "i64", "isize", "u8", "u16", "u32", "u64", "usize",
];

/// Schema expression for one property: explicit `schema:` reference or
/// inferred from the matched function argument's type.
fn property_schema(property: &Property, arg_type: Option<&syn::Type>) -> syn::Result<TokenStream> {
    if let Some(schema) = &property.schema {
        return Ok(quote! { &#schema });
    }

    let description = property.description.as_deref().ok_or_else(|| {
        syn::Error::new(
            property.span,
            format!("missing description for parameter '{}'", property.name),
        )
    })?;

    let arg_type = arg_type.ok_or_else(|| {
        syn::Error::new(
            property.span,
            format!(
                "cannot infer a schema for parameter '{}': no matching function argument",
                property.name
            ),
        )
    })?;
    let type_ident = type_name(arg_type).unwrap_or_default();

    let default = property.default.as_ref().map(|expr| quote! { .default(#expr) });
    if type_ident == "String" {
        Ok(quote! { &::proxmox_schema::StringSchema::new(#description) #default .schema() })
    } else if type_ident == "bool" {
        Ok(quote! { &::proxmox_schema::BooleanSchema::new(#description) #default .schema() })
    } else if INTEGER_TYPES.contains(&type_ident.as_str()) {
        Ok(quote! { &::proxmox_schema::IntegerSchema::new(#description) #default .schema() })
    } else {
        Err(syn::Error::new(
            arg_type.span(),
            format!("cannot infer a schema for parameter '{}' from this type", property.name),
        ))
    }
}

fn handle_api(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let api_def: JsonObject = syn::parse2(attr)?;
    let func: syn::ItemFn = syn::parse2(item)?;

    if func.sig.asyncness.is_some() {
        return Err(syn::Error::new(
            func.sig.span(),
            "async api functions are not supported by this stand-in",
        ));
    }

    let mut input = None;
    for entry in &api_def.entries {
        match entry.key.as_str() {
            "input" => input = Some(expect_object(&entry.value, entry.span, "input")?),
            other => {
                return Err(syn::Error::new(
                    entry.span,
                    format!("unsupported api attribute key '{}'", other),
                ));
            }
        }
    }

    let mut properties = Vec::new();
    if let Some(input) = input {
        for entry in &input.entries {
            match entry.key.as_str() {
                "properties" => {
                    let map = expect_object(&entry.value, entry.span, "properties")?;
                    for property in &map.entries {
                        properties.push(parse_property(property)?);
                    }
                }
                other => {
                    return Err(syn::Error::new(
                        entry.span,
                        format!("unsupported input attribute key '{}'", other),
                    ));
                }
            }
        }
    }

    let description = get_doc_comment(&func.attrs);
    if description.is_empty() {
        return Err(syn::Error::new(
            func.sig.span(),
            "missing doc comment (api method description)",
        ));
    }

    // map the function arguments onto the declared properties
    let mut extractions = Vec::new();
    let mut call_args = Vec::new();
    let mut arg_types: Vec<(String, syn::Type)> = Vec::new();
    for arg in &func.sig.inputs {
        let arg = match arg {
            syn::FnArg::Typed(arg) => arg,
            syn::FnArg::Receiver(receiver) => {
                return Err(syn::Error::new(receiver.span(), "methods are not supported"));
            }
        };
        let ident = match &*arg.pat {
            syn::Pat::Ident(pat) => pat.ident.clone(),
            other => return Err(syn::Error::new(other.span(), "unsupported argument pattern")),
        };
        let arg_name = ident.to_string();
        let ty = &*arg.ty;

        let property = properties
            .iter()
            .find(|property| property.name.replace('-', "_") == arg_name);
        match property {
            Some(property) => {
                let name = &property.name;
                let extraction = if let Some(default) = &property.default {
                    quote! {
                        let #ident: #ty = match input_params.get(#name) {
                            None | Some(&::serde_json::Value::Null) => #default,
                            Some(value) => ::serde_json::from_value(value.clone())
                                .map_err(|err| ::anyhow::format_err!("parameter '{}': {}", #name, err))?,
                        };
                    }
                } else if property.optional {
                    quote! {
                        let #ident: #ty = ::serde_json::from_value(
                            input_params.get(#name).cloned().unwrap_or(::serde_json::Value::Null),
                        )
                        .map_err(|err| ::anyhow::format_err!("parameter '{}': {}", #name, err))?;
                    }
                } else {
                    quote! {
                        let #ident: #ty = match input_params.get(#name) {
                            None | Some(&::serde_json::Value::Null) => {
                                return Err(::anyhow::format_err!(
                                    "parameter '{}': parameter is missing and it is not optional.",
                                    #name
                                ));
                            }
                            Some(value) => ::serde_json::from_value(value.clone())
                                .map_err(|err| ::anyhow::format_err!("parameter '{}': {}", #name, err))?,
                        };
                    }
                };
                extractions.push(extraction);
                arg_types.push((property.name.clone(), (*ty).clone()));
            }
            None => {
                // catch-all argument receiving the whole parameter object
                if type_name(ty).as_deref() == Some("Value") {
                    extractions.push(quote! {
                        let #ident: #ty = input_params.clone();
                    });
                } else {
                    return Err(syn::Error::new(
                        ident.span(),
                        format!("argument '{}' matches no declared input property", arg_name),
                    ));
                }
            }
        }
        call_args.push(ident);
    }

    // schema property list, sorted by name
    properties.sort_by(|a, b| a.name.cmp(&b.name));
    let mut schema_entries = Vec::new();
    for property in &properties {
        let arg_type = arg_types
            .iter()
            .find(|(name, _)| *name == property.name)
            .map(|(_, ty)| ty);
        let schema = property_schema(property, arg_type)?;
        let name = &property.name;
        let optional = property.optional;
        schema_entries.push(quote! { (#name, #optional, #schema) });
    }

    let fn_ident = &func.sig.ident;
    let vis = &func.vis;
    let wrapper_ident = format_ident!("api_function_{}", fn_ident);
    let method_ident = format_ident!(
        "API_METHOD_{}",
        fn_ident.to_string().to_uppercase(),
        span = fn_ident.span()
    );

    Ok(quote! {
        #func

        fn #wrapper_ident(
            input_params: ::serde_json::Value,
            _api_method_param: &::proxmox_router::ApiMethod,
            _rpc_env_param: &mut dyn ::proxmox_router::RpcEnvironment,
        ) -> ::std::result::Result<::serde_json::Value, ::anyhow::Error> {
            #(#extractions)*
            match #fn_ident(#(#call_args),*) {
                Ok(value) => ::serde_json::to_value(value)
                    .map_err(|err| ::anyhow::format_err!("error serializing result: {}", err)),
                Err(err) => Err(err),
            }
        }

        #vis const #method_ident: ::proxmox_router::ApiMethod = ::proxmox_router::ApiMethod::new(
            &::proxmox_router::ApiHandler::Sync(#wrapper_ident),
            &::proxmox_schema::ObjectSchema::new(#description, &[#(#schema_entries),*]),
        );
    })
}
