//! Index Store - 인덱스 영속화
//!
//! 저장 디렉토리 구성:
//! - `MANIFEST.json`: 현재 세대, 파일명, SHA-256 체크섬, 청크 수
//! - `chunks-<gen>.db`: rusqlite 메타데이터 (청크 본문 + BM25 포스팅/통계)
//! - `vectors-<gen>.bin`: 벡터 아티팩트
//!
//! 저장은 새 세대 파일을 모두 기록하고 fsync한 뒤 매니페스트를
//! 임시 파일 + rename으로 교체합니다. 중간에 프로세스가 죽으면 이전 세대가 유효합니다.
//! 로드는 전부 성공하거나 `RagError::Corrupted`를 반환합니다.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{RagError, Result};

use super::chunk::{Chunk, ChunkId, ChunkStore};
use super::lexical::{Bm25Params, LexicalIndex, Posting};
use super::vector::{DistanceMetric, SemanticIndex};

/// 매니페스트 파일명
pub const MANIFEST_FILE: &str = "MANIFEST.json";
/// 저장 형식 버전
const FORMAT_VERSION: u32 = 1;

// ============================================================================
// Types
// ============================================================================

/// 저장 세대 기록
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub generation: u64,
    pub chunk_db: String,
    pub chunk_db_sha256: String,
    pub vector_file: String,
    pub vector_sha256: String,
    pub chunk_count: usize,
    pub next_chunk_id: ChunkId,
    pub dimension: Option<usize>,
    pub metric: DistanceMetric,
    pub remove_stop_words: bool,
    pub saved_at: DateTime<Utc>,
}

/// 로드된 인덱스 (세 ID 집합이 일치함이 검증됨)
#[derive(Debug)]
pub struct LoadedIndex {
    pub manifest: Manifest,
    pub chunks: ChunkStore,
    pub lexical: LexicalIndex,
    pub semantic: SemanticIndex,
}

// ============================================================================
// IndexStore
// ============================================================================

#[derive(Debug, Clone)]
pub struct IndexStore {
    dir: PathBuf,
}

impl IndexStore {
    /// 저장 디렉토리 열기 (없으면 생성)
    pub fn open(dir: &Path) -> Result<Self> {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    /// 현재 매니페스트. 저장된 적이 없으면 `None`.
    pub fn read_manifest(&self) -> Result<Option<Manifest>> {
        let path = self.manifest_path();
        if !path.exists() {
            return Ok(None);
        }

        let bytes = fs::read(&path)?;
        let manifest: Manifest = serde_json::from_slice(&bytes)
            .map_err(|e| RagError::corrupted(&path, format!("unreadable manifest: {e}")))?;

        if manifest.format_version != FORMAT_VERSION {
            return Err(RagError::corrupted(
                &path,
                format!("unsupported format version {}", manifest.format_version),
            ));
        }
        Ok(Some(manifest))
    }

    /// 새 세대로 저장
    ///
    /// 세 구조의 ID 집합이 다르면 아무것도 쓰지 않고 `RagError::Consistency`.
    pub fn save(
        &self,
        generation: u64,
        chunks: &ChunkStore,
        lexical: &LexicalIndex,
        semantic: &SemanticIndex,
    ) -> Result<Manifest> {
        check_id_sets(chunks, lexical, semantic)?;

        let chunk_db = format!("chunks-{generation:08}.db");
        let vector_file = format!("vectors-{generation:08}.bin");
        let chunk_db_path = self.dir.join(&chunk_db);
        let vector_path = self.dir.join(&vector_file);

        // 이전에 중단된 같은 세대 파일 제거
        for path in [&chunk_db_path, &vector_path] {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }

        write_chunk_db(&chunk_db_path, chunks, lexical)?;
        write_vectors(&vector_path, semantic)?;

        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            generation,
            chunk_db_sha256: sha256_file(&chunk_db_path)?,
            chunk_db,
            vector_sha256: sha256_file(&vector_path)?,
            vector_file,
            chunk_count: chunks.len(),
            next_chunk_id: chunks.next_id(),
            dimension: semantic.dimension(),
            metric: semantic.metric(),
            remove_stop_words: lexical.params().remove_stop_words,
            saved_at: Utc::now(),
        };

        self.write_manifest(&manifest)?;
        self.remove_stale_generations(&manifest);

        tracing::info!(
            "Saved index generation {} ({} chunks) to {:?}",
            generation,
            manifest.chunk_count,
            self.dir
        );
        Ok(manifest)
    }

    /// 저장된 인덱스 로드
    ///
    /// - 매니페스트 없음 → `Ok(None)` (빈 코퍼스)
    /// - 파일 누락, 체크섬 불일치, 형식 오류, ID 집합 불일치 → `RagError::Corrupted`
    ///
    /// 저장 시와 불용어 설정이 다르면 청크 본문으로 BM25 인덱스를 다시 만듭니다.
    pub fn load(&self, params: Bm25Params) -> Result<Option<LoadedIndex>> {
        let Some(manifest) = self.read_manifest()? else {
            return Ok(None);
        };

        let chunk_db_path = self.dir.join(&manifest.chunk_db);
        let vector_path = self.dir.join(&manifest.vector_file);

        for (path, expected) in [
            (&chunk_db_path, &manifest.chunk_db_sha256),
            (&vector_path, &manifest.vector_sha256),
        ] {
            if !path.exists() {
                return Err(RagError::corrupted(path, "file listed in manifest is missing"));
            }
            let actual = sha256_file(path)?;
            if &actual != expected {
                return Err(RagError::corrupted(
                    path,
                    format!("checksum mismatch: expected {expected}, got {actual}"),
                ));
            }
        }

        let vector_bytes = fs::read(&vector_path)?;
        let semantic = SemanticIndex::from_artifact(&vector_bytes, &vector_path)?;
        if semantic.metric() != manifest.metric {
            return Err(RagError::corrupted(
                &vector_path,
                "distance metric differs from manifest",
            ));
        }

        let stored = read_chunk_db(&chunk_db_path)
            .map_err(|e| RagError::corrupted(&chunk_db_path, format!("unreadable metadata: {e}")))?;

        let mut restored = Vec::with_capacity(stored.chunks.len());
        for mut chunk in stored.chunks {
            let Some(embedding) = semantic.get(chunk.id) else {
                return Err(RagError::corrupted(
                    &vector_path,
                    format!("chunk {} has no vector", chunk.id),
                ));
            };
            chunk.embedding = embedding.to_vec();
            restored.push(chunk);
        }
        let chunks = ChunkStore::restore(restored, manifest.next_chunk_id);

        let lexical = if params.remove_stop_words == manifest.remove_stop_words {
            let stored_params = Bm25Params {
                remove_stop_words: manifest.remove_stop_words,
                ..params
            };
            LexicalIndex::from_parts(stored_params, stored.doc_lengths, stored.postings)
                .map_err(|e| RagError::corrupted(&chunk_db_path, e.to_string()))?
        } else {
            tracing::info!("Tokenizer settings changed, rebuilding lexical index from chunk text");
            let mut lexical = LexicalIndex::new(params);
            for chunk in chunks.iter() {
                lexical.index(chunk)?;
            }
            lexical
        };

        if chunks.len() != manifest.chunk_count {
            return Err(RagError::corrupted(
                &chunk_db_path,
                format!(
                    "manifest lists {} chunks, metadata has {}",
                    manifest.chunk_count,
                    chunks.len()
                ),
            ));
        }
        check_id_sets(&chunks, &lexical, &semantic)
            .map_err(|e| RagError::corrupted(&self.dir, e.to_string()))?;

        tracing::info!(
            "Loaded index generation {} ({} chunks)",
            manifest.generation,
            chunks.len()
        );

        Ok(Some(LoadedIndex {
            manifest,
            chunks,
            lexical,
            semantic,
        }))
    }

    fn write_manifest(&self, manifest: &Manifest) -> Result<()> {
        let path = self.manifest_path();
        let tmp_path = self.dir.join(format!("{MANIFEST_FILE}.tmp"));

        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            serde_json::to_writer_pretty(&mut file, manifest)?;
            file.flush()?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;
        sync_dir(&self.dir);
        Ok(())
    }

    /// 현재 세대가 아닌 데이터 파일 삭제 (실패는 경고만)
    fn remove_stale_generations(&self, current: &Manifest) {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let is_data = (name.starts_with("chunks-") && name.ends_with(".db"))
                || (name.starts_with("vectors-") && name.ends_with(".bin"));
            if !is_data || name == current.chunk_db || name == current.vector_file {
                continue;
            }
            if let Err(e) = fs::remove_file(entry.path()) {
                tracing::warn!("Failed to remove stale index file {}: {}", name, e);
            }
        }
    }
}

// ============================================================================
// Metadata DB
// ============================================================================

/// `chunks-<gen>.db`에서 읽은 내용
struct StoredMetadata {
    chunks: Vec<Chunk>,
    doc_lengths: BTreeMap<ChunkId, u32>,
    postings: HashMap<String, Vec<Posting>>,
}

fn write_chunk_db(path: &Path, chunks: &ChunkStore, lexical: &LexicalIndex) -> Result<()> {
    let mut conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;

    conn.execute_batch(
        "CREATE TABLE meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        CREATE TABLE chunks (
            id INTEGER PRIMARY KEY,
            source_document TEXT NOT NULL,
            sequence_index INTEGER NOT NULL,
            char_offset INTEGER NOT NULL,
            text TEXT NOT NULL,
            token_length INTEGER NOT NULL
        );
        CREATE TABLE postings (
            term TEXT NOT NULL,
            chunk_id INTEGER NOT NULL,
            tf INTEGER NOT NULL,
            PRIMARY KEY (term, chunk_id)
        ) WITHOUT ROWID;",
    )?;

    let tx = conn.transaction()?;
    {
        let mut meta = tx.prepare("INSERT INTO meta (key, value) VALUES (?1, ?2)")?;
        meta.execute(params!["format_version", FORMAT_VERSION.to_string()])?;
        meta.execute(params!["next_chunk_id", chunks.next_id().to_string()])?;

        let mut insert_chunk = tx.prepare(
            "INSERT INTO chunks (id, source_document, sequence_index, char_offset, text, token_length)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for chunk in chunks.iter() {
            let token_length = lexical.doc_length(chunk.id).unwrap_or(0);
            insert_chunk.execute(params![
                chunk.id as i64,
                chunk.source_document,
                chunk.sequence_index,
                chunk.char_offset as i64,
                chunk.text,
                token_length,
            ])?;
        }

        let mut insert_posting =
            tx.prepare("INSERT INTO postings (term, chunk_id, tf) VALUES (?1, ?2, ?3)")?;
        for (term, posting) in lexical.postings() {
            insert_posting.execute(params![term, posting.chunk_id as i64, posting.term_frequency])?;
        }
    }
    tx.commit()?;
    drop(conn);

    File::open(path)?.sync_all()?;
    Ok(())
}

fn read_chunk_db(path: &Path) -> rusqlite::Result<StoredMetadata> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;

    let mut chunks = Vec::new();
    let mut doc_lengths = BTreeMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT id, source_document, sequence_index, char_offset, text, token_length
             FROM chunks ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            let chunk = Chunk {
                id: row.get::<_, i64>(0)? as ChunkId,
                source_document: row.get(1)?,
                sequence_index: row.get(2)?,
                char_offset: row.get::<_, i64>(3)? as usize,
                text: row.get(4)?,
                embedding: Vec::new(),
            };
            let token_length: u32 = row.get(5)?;
            Ok((chunk, token_length))
        })?;
        for row in rows {
            let (chunk, token_length) = row?;
            doc_lengths.insert(chunk.id, token_length);
            chunks.push(chunk);
        }
    }

    let mut postings: HashMap<String, Vec<Posting>> = HashMap::new();
    {
        let mut stmt = conn.prepare("SELECT term, chunk_id, tf FROM postings")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                Posting {
                    chunk_id: row.get::<_, i64>(1)? as ChunkId,
                    term_frequency: row.get(2)?,
                },
            ))
        })?;
        for row in rows {
            let (term, posting) = row?;
            postings.entry(term).or_default().push(posting);
        }
    }

    Ok(StoredMetadata {
        chunks,
        doc_lengths,
        postings,
    })
}

// ============================================================================
// Helpers
// ============================================================================

fn write_vectors(path: &Path, semantic: &SemanticIndex) -> Result<()> {
    let file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let mut writer = BufWriter::new(file);
    semantic.write_artifact(&mut writer)?;
    writer.flush()?;
    writer
        .into_inner()
        .map_err(|e| RagError::Io(e.into_error()))?
        .sync_all()?;
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// rename 결과를 디스크에 반영 (지원하지 않는 플랫폼은 무시)
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

/// 청크 저장소, BM25, 벡터 인덱스의 ID 집합이 같은지 검사
pub fn check_id_sets(
    chunks: &ChunkStore,
    lexical: &LexicalIndex,
    semantic: &SemanticIndex,
) -> Result<()> {
    let chunk_ids: BTreeSet<ChunkId> = chunks.ids().collect();
    let lexical_ids: BTreeSet<ChunkId> = lexical.chunk_ids().collect();
    let semantic_ids: BTreeSet<ChunkId> = semantic.chunk_ids().collect();

    if let Some(&id) = chunk_ids.symmetric_difference(&lexical_ids).next() {
        return Err(RagError::Consistency {
            chunk_id: id,
            reason: "chunk store and lexical index disagree".to_string(),
        });
    }
    if let Some(&id) = chunk_ids.symmetric_difference(&semantic_ids).next() {
        return Err(RagError::Consistency {
            chunk_id: id,
            reason: "chunk store and semantic index disagree".to_string(),
        });
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (TempDir, IndexStore) {
        let dir = TempDir::new().unwrap();
        let store = IndexStore::open(&dir.path().join("index")).unwrap();
        (dir, store)
    }

    fn sample_index() -> (ChunkStore, LexicalIndex, SemanticIndex) {
        let texts = [
            ("ipc.txt", "Section 302: punishment for murder is death or life imprisonment."),
            ("ipc.txt", "Section 379: punishment for theft."),
            ("crpc.txt", "Section 154: information in cognizable cases."),
        ];

        let mut chunks = ChunkStore::new();
        let mut lexical = LexicalIndex::new(Bm25Params::default());
        let mut semantic = SemanticIndex::new(DistanceMetric::Cosine, Some(3));

        for (i, (source, text)) in texts.iter().enumerate() {
            let id = chunks.allocate_id();
            let chunk = Chunk {
                id,
                text: text.to_string(),
                source_document: source.to_string(),
                sequence_index: chunks.next_sequence_index(source),
                char_offset: 0,
                embedding: vec![i as f32 + 1.0, 1.0, 0.5],
            };
            lexical.index(&chunk).unwrap();
            semantic.insert(id, &chunk.embedding).unwrap();
            chunks.insert(chunk);
        }
        (chunks, lexical, semantic)
    }

    #[test]
    fn test_load_without_manifest_is_empty() {
        let (_dir, store) = create_test_store();
        assert!(store.load(Bm25Params::default()).unwrap().is_none());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let (_dir, store) = create_test_store();
        let (chunks, lexical, semantic) = sample_index();

        let manifest = store.save(1, &chunks, &lexical, &semantic).unwrap();
        assert_eq!(manifest.chunk_count, 3);

        let loaded = store.load(Bm25Params::default()).unwrap().unwrap();
        assert_eq!(loaded.manifest, manifest);
        assert_eq!(loaded.chunks.len(), 3);
        assert_eq!(loaded.chunks.next_id(), chunks.next_id());

        let original = chunks.get(0).unwrap();
        let restored = loaded.chunks.get(0).unwrap();
        assert_eq!(restored.as_ref(), original.as_ref());

        assert_eq!(
            loaded.lexical.search("punishment murder", 10),
            lexical.search("punishment murder", 10)
        );
        let query = [1.5, 1.0, 0.5];
        assert_eq!(
            loaded.semantic.search(&query, 3).unwrap(),
            semantic.search(&query, 3).unwrap()
        );
    }

    #[test]
    fn test_new_generation_replaces_old_files() {
        let (_dir, store) = create_test_store();
        let (chunks, lexical, semantic) = sample_index();

        store.save(1, &chunks, &lexical, &semantic).unwrap();
        store.save(2, &chunks, &lexical, &semantic).unwrap();

        assert!(!store.dir().join("chunks-00000001.db").exists());
        assert!(!store.dir().join("vectors-00000001.bin").exists());
        assert!(store.dir().join("chunks-00000002.db").exists());
        assert_eq!(store.read_manifest().unwrap().unwrap().generation, 2);
    }

    #[test]
    fn test_tampered_vectors_reported_as_corruption() {
        let (_dir, store) = create_test_store();
        let (chunks, lexical, semantic) = sample_index();
        let manifest = store.save(1, &chunks, &lexical, &semantic).unwrap();

        let path = store.dir().join(&manifest.vector_file);
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        let err = store.load(Bm25Params::default()).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_missing_file_reported_as_corruption() {
        let (_dir, store) = create_test_store();
        let (chunks, lexical, semantic) = sample_index();
        let manifest = store.save(1, &chunks, &lexical, &semantic).unwrap();

        fs::remove_file(store.dir().join(&manifest.chunk_db)).unwrap();
        let err = store.load(Bm25Params::default()).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_garbage_manifest_reported_as_corruption() {
        let (_dir, store) = create_test_store();
        fs::write(store.manifest_path(), b"{ not json").unwrap();
        let err = store.load(Bm25Params::default()).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_save_refuses_partial_index() {
        let (_dir, store) = create_test_store();
        let (chunks, lexical, mut semantic) = sample_index();
        semantic.remove(1);

        let result = store.save(1, &chunks, &lexical, &semantic);
        assert!(matches!(result, Err(RagError::Consistency { chunk_id: 1, .. })));
        assert!(store.read_manifest().unwrap().is_none());
    }

    #[test]
    fn test_stop_word_setting_change_rebuilds_lexical() {
        let (_dir, store) = create_test_store();
        let (chunks, lexical, semantic) = sample_index();
        store.save(1, &chunks, &lexical, &semantic).unwrap();

        let params = Bm25Params {
            remove_stop_words: false,
            ..Bm25Params::default()
        };
        let loaded = store.load(params).unwrap().unwrap();
        assert!(loaded.lexical.document_frequency("for") > 0);
        assert_eq!(loaded.lexical.len(), 3);
    }
}
