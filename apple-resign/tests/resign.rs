// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    apple_resign::*,
    bcder::Oid,
    std::{
        sync::{Arc, Mutex},
        time::Duration,
    },
};

const CODE_DIRECTORY_SLOT: u32 = 0;
const REQUIREMENTS_SLOT: u32 = 2;
const ENTITLEMENTS_SLOT: u32 = 5;
const ALTERNATE_CODE_DIRECTORY_SLOT: u32 = 0x1000;
const SIGNATURE_SLOT: u32 = 0x10000;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn designated(identifier: &str, common_name: &str) -> CodeRequirementExpression {
    CodeRequirementExpression::And(
        Box::new(CodeRequirementExpression::Identifier(identifier.into())),
        Box::new(CodeRequirementExpression::And(
            Box::new(CodeRequirementExpression::AnchorAppleGeneric),
            Box::new(CodeRequirementExpression::And(
                Box::new(CodeRequirementExpression::CertificateField(
                    0,
                    "subject.CN".into(),
                    CodeRequirementMatchExpression::Equal(common_name.into()),
                )),
                Box::new(CodeRequirementExpression::CertificateGeneric(
                    1,
                    Oid(vec![0x2a, 0x86, 0x48, 0x86, 0xf7, 0x63, 0x64, 0x06, 0x02, 0x01]),
                    CodeRequirementMatchExpression::Exists,
                )),
            )),
        )),
    )
}

fn code_directory(version: u32, hash_type: DigestType, ident: &str) -> CodeDirectoryBlob {
    let hash_len = hash_type.hash_len().unwrap();

    CodeDirectoryBlob::new(
        version,
        hash_type,
        ident,
        5,
        vec![Digest::from(vec![0xaa; hash_len]), Digest::from(vec![0xbb; hash_len])],
    )
    .unwrap()
}

struct SignatureBuilder {
    code_directories: Vec<CodeDirectoryBlob>,
    requirements: bool,
    wrappers: usize,
}

impl SignatureBuilder {
    fn new() -> Self {
        Self {
            code_directories: vec![
                code_directory(0x20400, DigestType::Sha1, "com.example.app"),
                code_directory(0x20400, DigestType::Sha256, "com.example.app"),
            ],
            requirements: true,
            wrappers: 1,
        }
    }

    fn build(self) -> Vec<u8> {
        let requirements = SuperBlob::from_blobs(
            CodeSigningMagic::RequirementSet,
            vec![
                (
                    u32::from(RequirementType::Designated),
                    RequirementBlob::from_expression(designated("com.example.app", "Old CN"))
                        .into(),
                ),
                (
                    u32::from(RequirementType::Library),
                    RequirementBlob::from_expression(CodeRequirementExpression::AnchorApple)
                        .into(),
                ),
            ],
        )
        .unwrap();

        let mut blobs = vec![];
        for (i, cd) in self.code_directories.into_iter().enumerate() {
            let slot = if i == 0 {
                CODE_DIRECTORY_SLOT
            } else {
                ALTERNATE_CODE_DIRECTORY_SLOT + i as u32 - 1
            };
            blobs.push((slot, BlobData::from(cd)));
            if i == 0 {
                if self.requirements {
                    blobs.push((REQUIREMENTS_SLOT, requirements.clone().into()));
                }
                blobs.push((
                    ENTITLEMENTS_SLOT,
                    EntitlementsBlob::from_data(b"<old/>".to_vec()).into(),
                ));
            }
        }
        for _ in 0..self.wrappers {
            blobs.push((
                SIGNATURE_SLOT,
                BlobWrapperBlob::from_data(b"OLDSIG".to_vec()).into(),
            ));
        }

        SuperBlob::from_blobs(CodeSigningMagic::EmbeddedSignature, blobs)
            .unwrap()
            .to_blob_bytes()
            .unwrap()
    }
}

struct TestBundle {
    bundle_id: Option<String>,
}

impl SignableBundle for TestBundle {
    fn entitlements(&self) -> Result<Option<Vec<u8>>, ResignError> {
        Ok(Some(b"<new/>".to_vec()))
    }

    fn resource_seal(&self) -> Result<Vec<u8>, ResignError> {
        Ok(b"seal".to_vec())
    }

    fn info_plist(&self) -> Result<Vec<u8>, ResignError> {
        Ok(b"info".to_vec())
    }

    fn changed_bundle_id(&self) -> Option<&str> {
        self.bundle_id.as_deref()
    }
}

struct TestSigner {
    adhoc: bool,
    team_id: Option<String>,
    delay: Duration,
    seen: Mutex<Vec<CodeDirectoryDigest>>,
}

impl TestSigner {
    fn new(adhoc: bool, team_id: Option<&str>) -> Self {
        Self {
            adhoc,
            team_id: team_id.map(|s| s.to_string()),
            delay: Duration::from_millis(0),
            seen: Mutex::new(vec![]),
        }
    }
}

impl CodeSigner for TestSigner {
    fn is_adhoc(&self) -> bool {
        self.adhoc
    }

    fn common_name(&self) -> &str {
        if self.adhoc {
            ""
        } else {
            "New CN"
        }
    }

    fn team_id(&self) -> Option<&str> {
        self.team_id.as_deref()
    }

    fn sign(
        &self,
        old_signature: &[u8],
        code_directories: &[CodeDirectoryDigest],
    ) -> Result<Vec<u8>, ResignError> {
        std::thread::sleep(self.delay);

        if old_signature != b"OLDSIG" {
            return Err(ResignError::Signer("unexpected old signature".into()));
        }

        self.seen
            .lock()
            .unwrap()
            .extend(code_directories.iter().cloned());

        Ok(b"NEWSIG".to_vec())
    }
}

fn digest(hash_type: DigestType, data: &[u8]) -> Digest {
    Digest::from(hash_type.digest_data(data).unwrap())
}

fn resign(
    data: &[u8],
    bundle: &TestBundle,
    signer: Arc<TestSigner>,
) -> Result<Vec<u8>, ResignError> {
    init_logging();

    Resigner::new(ResignSettings::default()).resign_signature_data(data, bundle, signer)
}

#[test]
fn roundtrip_is_lossless() {
    let data = SignatureBuilder::new().build();

    let signature = SuperBlob::from_bytes(&data).unwrap();
    let encoded = signature.to_blob_bytes().unwrap();
    assert_eq!(encoded, data);
    assert_eq!(SuperBlob::from_bytes(&encoded).unwrap(), signature);

    assert_eq!(signature.code_directories().count(), 2);
    assert!(matches!(
        signature.requirements().unwrap().entries[0].blob,
        BlobData::Requirement(_)
    ));
}

#[test]
fn requirement_set_is_not_an_embedded_signature() {
    let data = SuperBlob::new(CodeSigningMagic::RequirementSet)
        .to_blob_bytes()
        .unwrap();

    assert!(matches!(
        SuperBlob::from_bytes(&data),
        Err(ResignError::BadMagic(_))
    ));
}

#[test]
fn resign_end_to_end() {
    let data = SignatureBuilder::new().build();
    let bundle = TestBundle {
        bundle_id: Some("com.example.app2".into()),
    };
    let signer = Arc::new(TestSigner::new(false, Some("TEAM1")));

    let resigned = resign(&data, &bundle, signer.clone()).unwrap();
    let signature = SuperBlob::from_bytes(&resigned).unwrap();

    // Encoding is stable and the declared layout matches the data.
    assert_eq!(signature.to_blob_bytes().unwrap(), resigned);
    assert_eq!(signature.length as usize, resigned.len());

    let requirements = signature.requirements().unwrap();
    match &requirements.entries[0].blob {
        BlobData::Requirement(blob) => assert_eq!(
            blob.expression(),
            Some(&designated("com.example.app2", "New CN"))
        ),
        _ => panic!("designated requirement not decoded"),
    }
    let requirements_data = signature
        .get_blob_data(CodeSigningMagic::RequirementSet)
        .unwrap();

    let entitlements = signature.entitlements().unwrap().unwrap();
    assert_eq!(entitlements.as_bytes(), b"<new/>");
    let entitlements_data = entitlements.to_blob_bytes().unwrap();

    assert_eq!(signature.signature_wrapper().unwrap().payload(), b"NEWSIG");

    for cd in signature.code_directories() {
        assert_eq!(cd.ident(), "com.example.app2");
        assert_eq!(cd.team_id(), Some("TEAM1"));
        assert_eq!(cd.code_hashes().len(), 2);

        let hash_type = cd.hash_type;
        assert_eq!(
            cd.special_hash(SpecialSlot::Entitlements),
            Some(&digest(hash_type, &entitlements_data))
        );
        assert_eq!(
            cd.special_hash(SpecialSlot::Requirements),
            Some(&digest(hash_type, &requirements_data))
        );
        assert_eq!(
            cd.special_hash(SpecialSlot::ResourceDirectory),
            Some(&digest(hash_type, b"seal"))
        );
        assert_eq!(
            cd.special_hash(SpecialSlot::Info),
            Some(&digest(hash_type, b"info"))
        );
        assert!(cd.special_hash(SpecialSlot::Application).unwrap().is_null());
    }

    // The signer saw the final code directories.
    let expected = signature
        .code_directories()
        .map(|cd| CodeDirectoryDigest::from_code_directory(cd).unwrap())
        .collect::<Vec<_>>();
    assert_eq!(*signer.seen.lock().unwrap(), expected);
}

#[test]
fn resign_adhoc() {
    let data = SignatureBuilder::new().build();
    let bundle = TestBundle { bundle_id: None };
    let signer = Arc::new(TestSigner::new(true, None));

    let resigned = resign(&data, &bundle, signer).unwrap();
    let signature = SuperBlob::from_bytes(&resigned).unwrap();

    let requirements = signature.requirements().unwrap();
    assert!(requirements.entries.is_empty());
    assert_eq!(requirements.length, 12);

    for cd in signature.code_directories() {
        assert_eq!(cd.ident(), "com.example.app");
        assert_eq!(cd.team_id(), None);

        assert!(cd.special_hash(SpecialSlot::Entitlements).unwrap().is_null());
        assert_eq!(
            cd.special_hash(SpecialSlot::Info),
            Some(&digest(cd.hash_type, b"info"))
        );
    }

    // The entitlements blob itself is still replaced.
    assert_eq!(
        signature.entitlements().unwrap().unwrap().as_bytes(),
        b"<new/>"
    );
}

#[test]
fn identifier_change_propagates() {
    let mut cd = code_directory(0x20400, DigestType::Sha256, "com.example.app");
    cd.set_team_id("OLDTEAM").unwrap();
    let before = cd.clone();

    let data = SignatureBuilder {
        code_directories: vec![cd],
        ..SignatureBuilder::new()
    }
    .build();
    let bundle = TestBundle {
        bundle_id: Some("com.example.app2".into()),
    };
    // No team id from the signer: the existing one stays.
    let signer = Arc::new(TestSigner::new(false, None));

    let resigned = resign(&data, &bundle, signer).unwrap();
    let signature = SuperBlob::from_bytes(&resigned).unwrap();
    let after = signature.code_directories().next().unwrap();

    assert_eq!(after.team_id(), Some("OLDTEAM"));
    assert_eq!(after.ident_offset(), before.ident_offset());
    assert_eq!(after.hash_offset(), before.hash_offset() + 1);
    assert_eq!(after.team_offset(), before.team_offset().map(|o| o + 1));
    assert_eq!(after.length(), before.length() + 1);

    // Code digests themselves are untouched.
    assert_eq!(after.code_hashes(), before.code_hashes());
}

#[test]
fn team_id_unrecordable_on_old_code_directory() {
    let data = SignatureBuilder {
        code_directories: vec![code_directory(0x20100, DigestType::Sha1, "com.example.app")],
        ..SignatureBuilder::new()
    }
    .build();
    let bundle = TestBundle { bundle_id: None };
    let signer = Arc::new(TestSigner::new(false, Some("TEAM1")));

    let resigned = resign(&data, &bundle, signer).unwrap();
    let signature = SuperBlob::from_bytes(&resigned).unwrap();

    assert_eq!(signature.code_directories().next().unwrap().team_id(), None);
}

#[test]
fn multiple_signature_wrappers_are_ambiguous() {
    let data = SignatureBuilder {
        wrappers: 2,
        ..SignatureBuilder::new()
    }
    .build();
    let bundle = TestBundle { bundle_id: None };
    let signer = Arc::new(TestSigner::new(false, Some("TEAM1")));

    assert!(matches!(
        resign(&data, &bundle, signer),
        Err(ResignError::AmbiguousBlob(CodeSigningMagic::BlobWrapper, 2))
    ));
}

#[test]
fn missing_signature_wrapper() {
    let data = SignatureBuilder {
        wrappers: 0,
        ..SignatureBuilder::new()
    }
    .build();
    let bundle = TestBundle { bundle_id: None };
    let signer = Arc::new(TestSigner::new(false, Some("TEAM1")));

    assert!(matches!(
        resign(&data, &bundle, signer),
        Err(ResignError::BlobNotFound(CodeSigningMagic::BlobWrapper))
    ));
}

#[test]
fn slow_signer_times_out() {
    init_logging();

    let data = SignatureBuilder::new().build();
    let bundle = TestBundle { bundle_id: None };
    let mut signer = TestSigner::new(false, Some("TEAM1"));
    signer.delay = Duration::from_secs(5);

    let mut settings = ResignSettings::default();
    settings.set_signer_timeout(Duration::from_millis(50));

    let err = Resigner::new(settings)
        .resign_signature_data(&data, &bundle, Arc::new(signer))
        .unwrap_err();
    assert!(matches!(err, ResignError::SignerTimeout(_)));
    assert!(err.is_retryable());
}

#[test]
fn missing_requirement_set() {
    let hash_len = DigestType::Sha1.hash_len().unwrap();
    let cd = CodeDirectoryBlob::new(
        0x20400,
        DigestType::Sha1,
        "com.example.app",
        1,
        vec![Digest::from(vec![0xaa; hash_len])],
    )
    .unwrap();

    let data = SignatureBuilder {
        code_directories: vec![cd],
        requirements: false,
        ..SignatureBuilder::new()
    }
    .build();
    let bundle = TestBundle { bundle_id: None };

    for adhoc in [false, true] {
        let signer = Arc::new(TestSigner::new(adhoc, Some("TEAM1")));

        assert!(matches!(
            resign(&data, &bundle, signer),
            Err(ResignError::BlobNotFound(CodeSigningMagic::RequirementSet))
        ));
    }
}
