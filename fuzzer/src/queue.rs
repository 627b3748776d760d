use std::{
    fs,
    io::Write,
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context as _, Result};
use common::{hashbrown::hash_map::Entry, FxHashMap, FxHashSet};
use grammar::{Context, Tree, TreeView};

use crate::executor::ExitReason;

/// where an item stands in the minimize -> mutate pipeline, indices allow
/// resuming a budgeted scan in a later round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStage {
    MinimizeSubtrees(usize),
    MinimizeRecursions(usize),
    DetRules(usize),
    Random,
}

#[derive(Debug)]
pub struct QueueItem {
    pub id: u64,
    pub tree: Tree,
    /// bits first observed when this item was admitted
    pub fresh_bits: FxHashSet<usize>,
    pub all_bits: Vec<u8>,
    pub exit_reason: ExitReason,
    pub execution_time: Duration,
    pub stage: ProcessingStage,
}

/// coverage-indexed corpus: one representative per coverage bit, LIFO active
/// bag plus a processed shelf recycled by `new_round`
#[derive(Debug)]
pub struct Queue {
    inputs: Vec<QueueItem>,
    processed: Vec<QueueItem>,
    bit_to_inputs: FxHashMap<usize, Vec<u64>>,
    current_id: u64,
    work_dir: PathBuf,
}

impl Queue {
    pub fn new(work_dir: &Path) -> Result<Self> {
        common::fs::create_dir(&work_dir.join("queue"))?;

        Ok(Self {
            inputs: vec![],
            processed: vec![],
            bit_to_inputs: FxHashMap::default(),
            current_id: 0,
            work_dir: work_dir.to_path_buf(),
        })
    }

    /// does this coverage map carry any bit not represented by a live entry?
    pub fn has_fresh_bits(&self, all_bits: &[u8]) -> bool {
        all_bits
            .iter()
            .enumerate()
            .any(|(bit, &value)| value != 0 && !self.bit_to_inputs.contains_key(&bit))
    }

    /// offer an executed candidate; admitted iff it carries a fresh bit,
    /// returns the assigned id on admission
    pub fn add(
        &mut self,
        tree: Tree,
        all_bits: Vec<u8>,
        exit_reason: ExitReason,
        ctx: &Context,
        execution_time: Duration,
    ) -> Result<Option<u64>> {
        if !self.has_fresh_bits(&all_bits) {
            return Ok(None);
        }

        let id = self.current_id;
        let mut fresh_bits = FxHashSet::default();
        for (bit, _) in all_bits.iter().enumerate().filter(|(_, &value)| value != 0) {
            match self.bit_to_inputs.entry(bit) {
                Entry::Vacant(entry) => {
                    fresh_bits.insert(bit);
                    entry.insert(vec![id]);
                }
                Entry::Occupied(mut entry) => entry.get_mut().push(id),
            }
        }

        // persist the unparsed input plus a tree sidecar for offline
        // re-minimization, losing either would corrupt the bit index
        let mut buffer = vec![];
        tree.unparse_to(ctx, &mut buffer);
        let path = self.input_path(id, exit_reason);
        write_file_0600(&path, &buffer)?;
        write_file_0600(
            &sidecar_path(&path),
            &serde_json::to_vec(tree.rules()).context("serialize tree")?,
        )?;

        log::debug!(
            "add queue entry {} with {} fresh bits ({})",
            id,
            fresh_bits.len(),
            exit_reason
        );
        self.inputs.push(QueueItem {
            id,
            tree,
            fresh_bits,
            all_bits,
            exit_reason,
            execution_time,
            stage: ProcessingStage::MinimizeSubtrees(0),
        });
        self.current_id = self.current_id.wrapping_add(1);

        Ok(Some(id))
    }

    /// remove the most recent entry and drop it from the bit index
    pub fn pop(&mut self) -> Option<QueueItem> {
        let item = self.inputs.pop()?;

        self.bit_to_inputs.retain(|_, ids| {
            ids.retain(|&id| id != item.id);
            !ids.is_empty()
        });

        Some(item)
    }

    /// file a processed item: re-register it when it still represents an
    /// unindexed bit, otherwise drop it and its on-disk files
    pub fn finished(&mut self, mut item: QueueItem) -> Result<()> {
        if !self.has_fresh_bits(&item.all_bits) {
            log::debug!("queue entry {} is obsolete", item.id);
            let path = self.input_path(item.id, item.exit_reason);
            fs::remove_file(&path).with_context(|| format!("Cannot remove {path:?}"))?;
            let sidecar = sidecar_path(&path);
            fs::remove_file(&sidecar).with_context(|| format!("Cannot remove {sidecar:?}"))?;

            return Ok(());
        }

        item.fresh_bits.clear();
        for (bit, _) in item
            .all_bits
            .iter()
            .enumerate()
            .filter(|(_, &value)| value != 0)
        {
            match self.bit_to_inputs.entry(bit) {
                Entry::Vacant(entry) => {
                    item.fresh_bits.insert(bit);
                    entry.insert(vec![item.id]);
                }
                Entry::Occupied(mut entry) => entry.get_mut().push(item.id),
            }
        }

        self.processed.push(item);
        Ok(())
    }

    /// return the processed shelf to the active bag
    pub fn new_round(&mut self) {
        self.inputs.append(&mut self.processed);
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn num_entries(&self) -> usize {
        self.inputs.len() + self.processed.len()
    }

    pub fn num_indexed_bits(&self) -> usize {
        self.bit_to_inputs.len()
    }

    fn input_path(&self, id: u64, exit_reason: ExitReason) -> PathBuf {
        self.work_dir
            .join("queue")
            .join(format!("id:{:09},er:{}", id, exit_reason.code()))
    }
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().expect("input file name").to_os_string();
    name.push(".tree.json");
    path.with_file_name(name)
}

pub(crate) fn write_file_0600(path: &Path, data: &[u8]) -> Result<()> {
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .and_then(|mut file| file.write_all(data))
        .with_context(|| format!("Cannot save input {path:?}"))
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    // S -> "a" S | "b"
    fn letter_grammar() -> Context {
        let mut ctx = Context::new();
        ctx.add_format_rule("S", "a{S}").unwrap();
        ctx.add_format_rule("S", "b").unwrap();
        ctx.initialize().unwrap();
        ctx
    }

    fn some_tree(ctx: &Context) -> Tree {
        let mut tree = Tree::default();
        tree.generate_from_nt(ctx.start(), 1, ctx);
        tree
    }

    fn bits(set: &[usize]) -> Vec<u8> {
        let mut all_bits = vec![0; 8];
        for &bit in set {
            all_bits[bit] = 1;
        }
        all_bits
    }

    fn add(queue: &mut Queue, ctx: &Context, set: &[usize]) -> Option<u64> {
        queue
            .add(
                some_tree(ctx),
                bits(set),
                ExitReason::Normal,
                ctx,
                Duration::ZERO,
            )
            .unwrap()
    }

    fn check_index(queue: &Queue) {
        // every indexed bit has a non-empty id list backed by a live item
        // with that bit set
        let live: Vec<&QueueItem> = queue.inputs.iter().chain(&queue.processed).collect();
        for (&bit, ids) in &queue.bit_to_inputs {
            assert!(!ids.is_empty());
            for &id in ids {
                let item = live
                    .iter()
                    .find(|item| item.id == id)
                    .expect("indexed id is live");
                assert_ne!(item.all_bits[bit], 0);
            }
        }
    }

    #[test]
    fn admission_registers_fresh_bits() {
        let ctx = letter_grammar();
        let dir = tempfile::tempdir().unwrap();
        let mut queue = Queue::new(dir.path()).unwrap();

        assert_eq!(add(&mut queue, &ctx, &[0]), Some(0));
        assert_eq!(queue.num_entries(), 1);
        assert_eq!(queue.bit_to_inputs[&0], vec![0]);
        check_index(&queue);

        // second input with only known bits is silently discarded
        assert_eq!(add(&mut queue, &ctx, &[0]), None);
        assert_eq!(queue.num_entries(), 1);

        // files are written with mode 0600
        let path = dir.path().join("queue/id:000000000,er:0");
        assert_eq!(fs::read(&path).unwrap(), b"b");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(sidecar_path(&path).is_file());
    }

    #[test]
    fn pop_removes_ids_from_index() {
        let ctx = letter_grammar();
        let dir = tempfile::tempdir().unwrap();
        let mut queue = Queue::new(dir.path()).unwrap();

        // A{1,2}, B{2,3}, C{3,4}
        add(&mut queue, &ctx, &[1, 2]);
        add(&mut queue, &ctx, &[2, 3]);
        add(&mut queue, &ctx, &[3, 4]);

        // LIFO: pop yields C, bit 4 loses its only representative
        let item = queue.pop().unwrap();
        assert_eq!(item.id, 2);
        assert!(!queue.bit_to_inputs.contains_key(&4));
        assert_eq!(queue.bit_to_inputs[&3], vec![1]);
        check_index(&queue);

        // finished(C): bit 4 unindexed again, so C is re-registered
        queue.finished(item).unwrap();
        assert_eq!(queue.processed.len(), 1);
        assert_eq!(queue.processed[0].fresh_bits, [4].into_iter().collect());
        assert_eq!(queue.bit_to_inputs[&4], vec![2]);
        assert_eq!(queue.bit_to_inputs[&3], vec![1, 2]);
        check_index(&queue);
    }

    #[test]
    fn finished_drops_obsolete_items() {
        let ctx = letter_grammar();
        let dir = tempfile::tempdir().unwrap();
        let mut queue = Queue::new(dir.path()).unwrap();

        add(&mut queue, &ctx, &[1]);
        add(&mut queue, &ctx, &[1, 2]);

        // item 1 survives finished() because bit 2 has no other
        // representative
        let item = queue.pop().unwrap();
        queue.finished(item).unwrap();
        assert_eq!(queue.processed.len(), 1);

        // pop item 0, its only bit is covered by the re-registered item 1
        let item = queue.pop().unwrap();
        assert_eq!(item.id, 0);
        queue.finished(item).unwrap();
        assert_eq!(queue.processed.len(), 1);
        assert!(!dir.path().join("queue/id:000000000,er:0").exists());
        assert!(dir.path().join("queue/id:000000001,er:0").exists());
        check_index(&queue);
    }

    #[test]
    fn new_round_recycles_processed_items() {
        let ctx = letter_grammar();
        let dir = tempfile::tempdir().unwrap();
        let mut queue = Queue::new(dir.path()).unwrap();

        add(&mut queue, &ctx, &[0]);
        let item = queue.pop().unwrap();
        queue.finished(item).unwrap();
        assert!(queue.is_empty());

        queue.new_round();
        assert!(!queue.is_empty());
        assert_eq!(queue.pop().unwrap().id, 0);
    }

    #[test]
    fn pop_readd_is_idempotent_modulo_id() {
        let ctx = letter_grammar();
        let dir = tempfile::tempdir().unwrap();
        let mut queue = Queue::new(dir.path()).unwrap();

        add(&mut queue, &ctx, &[0, 5]);
        let item = queue.pop().unwrap();
        assert_eq!(queue.num_indexed_bits(), 0);

        let id = queue
            .add(item.tree, item.all_bits.clone(), item.exit_reason, &ctx, item.execution_time)
            .unwrap()
            .expect("re-admitted");
        assert_eq!(id, 1);
        assert_eq!(queue.num_indexed_bits(), 2);
        assert_eq!(queue.inputs[0].fresh_bits, item.fresh_bits);
        assert_eq!(queue.inputs[0].all_bits, item.all_bits);
        check_index(&queue);
    }
}
