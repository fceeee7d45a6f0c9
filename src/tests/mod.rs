mod arsc_roundtrip;
mod dex_roundtrip;
