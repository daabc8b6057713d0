#[cfg(test)]
mod tests {
    use crate::android::binary_xml::AndroidManifest;
    use crate::instrumentation::{InstrumentationError, InstrumentationInfo};
    use crate::read_instrumentation_info;
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;
    use zip::write::{SimpleFileOptions, ZipWriter};

    const ANDROID_NS: &str = "http://schemas.android.com/apk/res/android";
    const NO_ENTRY: u32 = 0xFFFF_FFFF;
    const TYPE_STRING: u8 = 0x03;
    const TYPE_INT_DEC: u8 = 0x10;

    fn push_u16(buf: &mut Vec<u8>, value: u16) {
        buf.extend_from_slice(&value.to_le_bytes());
    }

    fn push_u32(buf: &mut Vec<u8>, value: u32) {
        buf.extend_from_slice(&value.to_le_bytes());
    }

    fn chunk(chunk_type: u16, header_size: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + payload.len());
        push_u16(&mut out, chunk_type);
        push_u16(&mut out, header_size);
        push_u32(&mut out, 8 + payload.len() as u32);
        out.extend_from_slice(payload);
        out
    }

    fn string_pool(strings: &[&str]) -> Vec<u8> {
        let mut data = Vec::new();
        let mut offsets = Vec::new();
        for s in strings {
            offsets.push(data.len() as u32);
            let units: Vec<u16> = s.encode_utf16().collect();
            push_u16(&mut data, units.len() as u16);
            for unit in units {
                push_u16(&mut data, unit);
            }
            push_u16(&mut data, 0);
        }
        let mut payload = Vec::new();
        push_u32(&mut payload, strings.len() as u32); // string count
        push_u32(&mut payload, 0); // style count
        push_u32(&mut payload, 0); // flags (UTF-16)
        push_u32(&mut payload, 28 + 4 * strings.len() as u32); // strings start
        push_u32(&mut payload, 0); // styles start
        for offset in offsets {
            push_u32(&mut payload, offset);
        }
        payload.extend_from_slice(&data);
        chunk(0x0001, 28, &payload)
    }

    fn namespace_chunk(chunk_type: u16, prefix_idx: u32, uri_idx: u32) -> Vec<u8> {
        let mut payload = Vec::new();
        push_u32(&mut payload, 1); // line number
        push_u32(&mut payload, NO_ENTRY); // comment
        push_u32(&mut payload, prefix_idx);
        push_u32(&mut payload, uri_idx);
        chunk(chunk_type, 16, &payload)
    }

    fn start_element(name_idx: u32, attrs: &[(u32, u32, u32, u8, u32)]) -> Vec<u8> {
        let mut payload = Vec::new();
        push_u32(&mut payload, 1); // line number
        push_u32(&mut payload, NO_ENTRY); // comment
        push_u32(&mut payload, NO_ENTRY); // element namespace
        push_u32(&mut payload, name_idx);
        push_u16(&mut payload, 20); // attributeStart
        push_u16(&mut payload, 20); // attributeSize
        push_u16(&mut payload, attrs.len() as u16);
        push_u16(&mut payload, 0); // idIndex
        push_u16(&mut payload, 0); // classIndex
        push_u16(&mut payload, 0); // styleIndex
        for &(ns_idx, attr_name_idx, raw_idx, data_type, data) in attrs {
            push_u32(&mut payload, ns_idx);
            push_u32(&mut payload, attr_name_idx);
            push_u32(&mut payload, raw_idx);
            push_u16(&mut payload, 8); // value size
            payload.push(0); // res0
            payload.push(data_type);
            push_u32(&mut payload, data);
        }
        chunk(0x0102, 16, &payload)
    }

    fn end_element(name_idx: u32) -> Vec<u8> {
        let mut payload = Vec::new();
        push_u32(&mut payload, 1);
        push_u32(&mut payload, NO_ENTRY);
        push_u32(&mut payload, NO_ENTRY);
        push_u32(&mut payload, name_idx);
        chunk(0x0103, 16, &payload)
    }

    /// A minimal binary manifest equivalent to:
    ///
    /// ```xml
    /// <manifest package="com.example.test">
    ///     <uses-sdk android:minSdkVersion="21" />
    ///     <instrumentation android:targetPackage="com.example"
    ///         android:name=".Runner" />
    /// </manifest>
    /// ```
    fn synthetic_binary_manifest() -> Vec<u8> {
        let strings = [
            "android",          // 0
            ANDROID_NS,         // 1
            "package",          // 2
            "minSdkVersion",    // 3
            "targetPackage",    // 4
            "name",             // 5
            "manifest",         // 6
            "uses-sdk",         // 7
            "instrumentation",  // 8
            "com.example.test", // 9
            "com.example",      // 10
            ".Runner",          // 11
        ];
        let mut body = Vec::new();
        body.extend(namespace_chunk(0x0100, 0, 1));
        body.extend(start_element(6, &[(NO_ENTRY, 2, 9, TYPE_STRING, 9)]));
        body.extend(start_element(7, &[(1, 3, NO_ENTRY, TYPE_INT_DEC, 21)]));
        body.extend(end_element(7));
        body.extend(start_element(
            8,
            &[(1, 4, 10, TYPE_STRING, 10), (1, 5, 11, TYPE_STRING, 11)],
        ));
        body.extend(end_element(8));
        body.extend(end_element(6));
        body.extend(namespace_chunk(0x0101, 0, 1));

        let mut payload = string_pool(&strings);
        payload.extend(body);
        chunk(0x0003, 8, &payload)
    }

    fn write_test_apk(path: &Path, manifest: Option<&[u8]>) {
        let file = File::create(path).expect("create test apk");
        let mut writer = ZipWriter::new(file);
        let options = SimpleFileOptions::default();
        if let Some(bytes) = manifest {
            writer
                .start_file("AndroidManifest.xml", options)
                .expect("start manifest entry");
            writer.write_all(bytes).expect("write manifest entry");
        }
        writer
            .start_file("classes.dex", options)
            .expect("start dex entry");
        writer.write_all(b"dex\n035").expect("write dex entry");
        writer.finish().expect("finish apk");
    }

    #[test]
    fn decodes_synthetic_binary_manifest() {
        let bytes = synthetic_binary_manifest();
        let manifest = AndroidManifest::from_bytes(&bytes).expect("decode binary manifest");
        assert_eq!(manifest.package_name(), Some("com.example.test"));

        let info = InstrumentationInfo::from_manifest(&manifest).expect("extract info");
        assert_eq!(info.instrumentation_package, "com.example.test");
        assert_eq!(info.application_package, "com.example");
        assert_eq!(info.min_sdk_version, Some(21));
        assert_eq!(info.test_runner_class, "com.example.test.Runner");
    }

    #[test]
    fn reads_instrumentation_info_from_apk_on_disk() {
        let path = std::env::temp_dir().join("apkinfo-e2e-test.apk");
        write_test_apk(&path, Some(&synthetic_binary_manifest()));

        let info = read_instrumentation_info(&path).expect("read info from apk");
        assert_eq!(info.application_package, "com.example");
        assert_eq!(info.test_runner_class, "com.example.test.Runner");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn apk_without_manifest_entry_fails_upstream() {
        let path = std::env::temp_dir().join("apkinfo-e2e-no-manifest.apk");
        write_test_apk(&path, None);

        let err = read_instrumentation_info(&path).unwrap_err();
        match err {
            InstrumentationError::Apk(inner) => {
                assert!(inner.to_string().contains("AndroidManifest.xml"))
            }
            other => panic!("unexpected error: {other:?}"),
        }

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn garbage_manifest_entry_fails_upstream() {
        let path = std::env::temp_dir().join("apkinfo-e2e-garbage.apk");
        write_test_apk(&path, Some(b"not binary xml at all"));

        let err = read_instrumentation_info(&path).unwrap_err();
        assert!(matches!(err, InstrumentationError::Manifest(_)));

        std::fs::remove_file(&path).ok();
    }
}
