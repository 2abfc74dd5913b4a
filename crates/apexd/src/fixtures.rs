// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

macro_rules! fixtures {
    () => {
        use rstest::fixture;

        #[allow(dead_code)]
        fn init_logging() {
            let sub = tracing_subscriber::FmtSubscriber::builder()
                .with_max_level(tracing::Level::TRACE)
                .without_time()
                .with_test_writer()
                .finish();
            let _ = tracing::subscriber::set_global_default(sub);
        }

        use crate as apexd;

        #[fixture]
        fn tmpdir() -> tempdir::TempDir {
            tempdir::TempDir::new("apexd-test-").expect("failed to create dir for test")
        }

        /// A config with every well-known path redirected below the
        /// given root, with the package and key directories created.
        #[allow(dead_code)]
        fn test_config(root: &std::path::Path) -> apexd::Config {
            let mut config = apexd::Config::default();
            config.paths.apex_root = root.join("apex");
            config.paths.system_dir = root.join("system/apex");
            config.paths.active_dir = root.join("data/apex/active");
            config.paths.sessions_dir = root.join("data/apex/sessions");
            config.paths.key_dirs = vec![root.join("keys")];
            config.paths.status_file = root.join("apexd.status");
            config.paths.loop_control = root.join("dev/loop-control");
            config.paths.loop_dir = root.join("dev/block");
            config.paths.dm_control = root.join("dev/mapper/control");
            config.paths.dm_dev_dir = root.join("dev/block");
            config.paths.sysfs_block_dir = root.join("sys/block");
            for dir in [
                &config.paths.apex_root,
                &config.paths.system_dir,
                &config.paths.active_dir,
                &config.paths.sessions_dir,
                &config.paths.key_dirs[0],
                &config.paths.loop_dir,
            ] {
                apexd::util::makedirs_with_perms(dir, 0o755).expect("failed to make test dirs");
            }
            config
        }

        /// An Ed25519 signing identity for building test packages.
        #[allow(dead_code)]
        struct TestKey {
            keypair: ring::signature::Ed25519KeyPair,
        }

        #[allow(dead_code)]
        impl TestKey {
            fn generate() -> Self {
                let rng = ring::rand::SystemRandom::new();
                let pkcs8 = ring::signature::Ed25519KeyPair::generate_pkcs8(&rng)
                    .expect("failed to generate test key");
                let keypair = ring::signature::Ed25519KeyPair::from_pkcs8(pkcs8.as_ref())
                    .expect("failed to load test key");
                Self { keypair }
            }

            /// Register this key as the trusted key for a package name.
            fn install(&self, config: &apexd::Config, package_name: &str) {
                use ring::signature::KeyPair;
                let dest = config.paths.key_dirs[0].join(package_name);
                std::fs::write(dest, self.keypair.public_key().as_ref())
                    .expect("failed to install trusted key");
            }

            fn sign(&self, message: &[u8]) -> Vec<u8> {
                self.keypair.sign(message).as_ref().to_vec()
            }
        }

        /// Write a minimal but well-formed package file.
        #[allow(dead_code)]
        fn make_apex(
            dest: &std::path::Path,
            key: &TestKey,
            name: &str,
            version: u64,
            pre_install_hook: &str,
            post_install_hook: &str,
        ) {
            use std::io::Write;

            let manifest = serde_json::json!({
                "name": name,
                "version": version,
                "preInstallHook": pre_install_hook,
                "postInstallHook": post_install_hook,
            });
            // one data block followed by one hash tree block
            let payload = vec![0xA5u8; 8192];
            let descriptor = serde_json::json!({
                "image_size": 4096,
                "tree_offset": 4096,
                "data_block_size": 4096,
                "hash_block_size": 4096,
                "hash_algorithm": "sha256",
                "version": 1,
                "root_digest": "af1c10e7c2b57f9ec2e93e15d4919c2c6ad78e41f0f46d1dfd8dfa0a9096dbf7",
                "salt": "deadbeef",
            });
            let descriptor_bytes =
                serde_json::to_vec(&descriptor).expect("failed to serialize descriptor");
            let signature = key.sign(&descriptor_bytes);

            let file = std::fs::File::create(dest).expect("failed to create package file");
            let mut writer = zip::ZipWriter::new(file);
            let options = zip::write::FileOptions::default()
                .compression_method(zip::CompressionMethod::Stored);
            writer
                .start_file(apexd::apex_file::MANIFEST_ENTRY, options)
                .expect("failed to start manifest entry");
            writer
                .write_all(manifest.to_string().as_bytes())
                .expect("failed to write manifest");
            writer
                .start_file(apexd::apex_file::PAYLOAD_ENTRY, options)
                .expect("failed to start payload entry");
            writer.write_all(&payload).expect("failed to write payload");
            writer
                .start_file(apexd::apex_file::VERITY_ENTRY, options)
                .expect("failed to start verity entry");
            writer
                .write_all(&descriptor_bytes)
                .expect("failed to write descriptor");
            writer
                .start_file(apexd::apex_file::VERITY_SIG_ENTRY, options)
                .expect("failed to start signature entry");
            writer
                .write_all(&signature)
                .expect("failed to write signature");
            writer.finish().expect("failed to finish package file");
        }

        /// Build a trusted package in one call: generates a key,
        /// installs it, and writes the package file.
        #[allow(dead_code)]
        fn make_trusted_apex(
            config: &apexd::Config,
            dest: &std::path::Path,
            name: &str,
            version: u64,
        ) {
            let key = TestKey::generate();
            key.install(config, name);
            make_apex(dest, &key, name, version, "", "");
        }
    };
}
