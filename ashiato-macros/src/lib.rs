use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, DeriveInput, LitStr};

/// Returns true if the enum carries a `#[str_enum(serde)]` attribute
fn wants_serde(input: &DeriveInput) -> bool {
    let mut serde = false;
    for attr in input.attrs.iter().filter(|a| a.path().is_ident("str_enum")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("serde") {
                serde = true;
                Ok(())
            } else {
                Err(meta.error("unsupported str_enum option"))
            }
        })
        .expect("failed to parse str_enum attribute");
    }
    serde
}

/// Derives string conversions for a fieldless enum.
///
/// Each variant maps to the string given in `#[str("...")]`, or to its
/// identifier when the attribute is missing. The derive generates
/// `as_str()`, `variants()`, `FromStr` and `Display`. When the enum is
/// annotated with `#[str_enum(serde)]`, `serde::Serialize` and
/// `serde::Deserialize` are implemented on top of the same strings.
#[proc_macro_derive(StrEnum, attributes(str, str_enum))]
pub fn str_enum_derive(item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as DeriveInput);
    let enum_name = &input.ident;
    let serde = wants_serde(&input);

    let data_enum = match input.data {
        syn::Data::Enum(data_enum) => data_enum,
        _ => panic!("This macro only supports enums."),
    };

    let mut as_str_arms = vec![];
    let mut from_str_arms = vec![];
    let mut variants = vec![];

    for v in data_enum.variants.iter() {
        let name = &v.ident;

        if !v.fields.is_empty() {
            panic!("enum variant cannot hold values")
        }

        let value = match v.attrs.iter().find(|&attr| attr.path().is_ident("str")) {
            Some(s) => {
                let lit: LitStr = s.parse_args().expect("failed to parse args");
                lit.value()
            }
            // by default we take the name of the variant
            None => name.to_string(),
        };

        as_str_arms.push(quote!(Self::#name => #value,));
        from_str_arms.push(quote!(#value => Ok(Self::#name),));
        variants.push(quote!(Self::#name,));
    }

    let variants_len = variants.len();
    let unknown = format!("unknown {enum_name} string");

    let serde_impls = if serde {
        quote!(
            impl serde::Serialize for #enum_name {
                fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
                where
                    S: serde::Serializer,
                {
                    serializer.serialize_str(self.as_str())
                }
            }

            impl<'de> serde::Deserialize<'de> for #enum_name {
                fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
                where
                    D: serde::Deserializer<'de>,
                {
                    let s = <String as serde::Deserialize>::deserialize(deserializer)?;
                    <Self as core::str::FromStr>::from_str(&s).map_err(serde::de::Error::custom)
                }
            }
        )
    } else {
        quote!()
    };

    quote!(
        impl core::str::FromStr for #enum_name {
            type Err = &'static str;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    #(#from_str_arms)*
                    _ => Err(#unknown),
                }
            }
        }

        impl core::fmt::Display for #enum_name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl #enum_name {
            pub const fn variants() -> [Self; #variants_len] {
                [
                    #(#variants)*
                ]
            }

            #[inline(always)]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    #(#as_str_arms)*
                }
            }
        }

        #serde_impls
    )
    .into()
}
