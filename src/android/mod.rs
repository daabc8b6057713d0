pub mod binary_xml;
pub mod zip;
