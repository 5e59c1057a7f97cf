// SPDX-FileCopyrightText: 2025 Bokaka Project
// SPDX-License-Identifier: GPL-3.0-or-later

//! Persistent state store.
//!
//! Owns the in-memory mirror of [`PersistedState`] and the NVM image
//! behind it. Writes are coalesced: mutators only mark the mirror dirty
//! and a periodic [`Store::tick`] flushes after [`STORAGE_COALESCE_MS`],
//! because the backing pages survive only ~10^4 erase/write cycles. Two
//! byte-range fast paths cover the fields a tap event touches, so a tap
//! costs 8-20 written bytes instead of a full image rewrite.

mod crc;
mod layout;

pub use layout::PersistedState;

use crate::device_id::DeviceId;
use crate::hal::{NvmHal, UidSource};
use consts::{
    DEVICE_UID_LEN, MAX_LINKS, SECRET_KEY_LEN, STORAGE_AREA_SIZE, STORAGE_BASE_ADDR,
    STORAGE_COALESCE_MS, STORAGE_MAGIC, STORAGE_VERSION,
};
use crc::crc32_words;
use layout::{IMAGE_LEN, OFF_CRC, OFF_LENGTH, OFF_MAGIC, OFF_PAYLOAD, OFF_VERSION, PAYLOAD_LEN,
    P_LINKS, P_LINK_COUNT, P_TAP_COUNT};

/// Bytes written between pacing yields during a full save.
const WRITE_CHUNK: usize = 32;

/// Outcome of [`Store::add_link`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AddLink {
    AddedNew,
    AlreadyPresent,
}

pub struct Store<N: NvmHal> {
    nvm: N,
    state: PersistedState,
    dirty: bool,
    last_save_ms: u32,
    last_link_index: usize,
    link_count_changed: bool,
}

impl<N: NvmHal> Store<N> {
    pub fn new(nvm: N) -> Self {
        Store {
            nvm,
            state: PersistedState::default(),
            dirty: false,
            last_save_ms: 0,
            last_link_index: 0,
            link_count_changed: false,
        }
    }

    /// Load the image from NVM, or initialize a fresh one when nothing
    /// valid is there. A valid image whose `selfId` is still all-zero
    /// gets the hardware UID stamped in once and saved immediately.
    /// Fails only if the underlying NVM cannot be brought up.
    pub fn begin(&mut self, uid: &impl UidSource, now_ms: u32) -> Result<(), N::Error> {
        self.nvm.begin(STORAGE_AREA_SIZE)?;

        match self.load() {
            Some(state) => {
                self.state = state;
                if self.state.self_id.is_zero() {
                    info!("storage: valid image without selfId, capturing UID");
                    self.state.self_id = DeviceId::new(uid.device_uid());
                    self.dirty = true;
                    let _ = self.save_full(now_ms);
                } else {
                    debug!("storage: image loaded, taps={}", self.state.total_tap_count);
                }
            }
            None => {
                info!("storage: no valid image, initializing");
                self.state = PersistedState::default();
                self.state.self_id = DeviceId::new(uid.device_uid());
                let _ = self.save_full(now_ms);
            }
        }

        self.dirty = false;
        self.last_save_ms = now_ms;
        Ok(())
    }

    /// Coalesced flush: a dirty mirror is written out once
    /// [`STORAGE_COALESCE_MS`] has passed since the last save. A failed
    /// write leaves the dirty flag set so a later tick retries.
    pub fn tick(&mut self, now_ms: u32) {
        if !self.dirty {
            return;
        }
        if now_ms.wrapping_sub(self.last_save_ms) >= STORAGE_COALESCE_MS
            && self.save_full(now_ms).is_err()
        {
            warn!("storage: deferred save failed, will retry");
        }
    }

    /// Write the whole container: header stamped, CRC recomputed, bytes
    /// pushed in [`WRITE_CHUNK`] chunks with a 1 ms yield between chunks
    /// so serial RX keeps draining during the erase/program cycle.
    pub fn save_full(&mut self, now_ms: u32) -> Result<(), N::Error> {
        let mut image = [0u8; IMAGE_LEN];
        image[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&STORAGE_MAGIC.to_le_bytes());
        image[OFF_VERSION..OFF_VERSION + 2].copy_from_slice(&STORAGE_VERSION.to_le_bytes());
        image[OFF_LENGTH..OFF_LENGTH + 2]
            .copy_from_slice(&(PAYLOAD_LEN as u16).to_le_bytes());

        let payload: &mut [u8; PAYLOAD_LEN] =
            (&mut image[OFF_PAYLOAD..]).try_into().unwrap();
        self.state.encode_payload(payload);
        let crc = crc32_words(&image[OFF_PAYLOAD..]);
        image[OFF_CRC..OFF_CRC + 4].copy_from_slice(&crc.to_le_bytes());

        for (i, &b) in image.iter().enumerate() {
            self.nvm.write_byte(STORAGE_BASE_ADDR + i, b)?;
            if i % WRITE_CHUNK == WRITE_CHUNK - 1 {
                self.nvm.delay_ms(1);
            }
        }
        self.nvm.commit()?;

        debug!("storage: full save done");
        self.dirty = false;
        self.last_save_ms = now_ms;
        Ok(())
    }

    /// Fast path after a tap: persist only `totalTapCount` and the CRC.
    /// The CRC still covers the whole in-memory payload, and is written
    /// last so a power cut leaves an image that fails validation rather
    /// than one that lies.
    pub fn save_tap_count_fast(&mut self, now_ms: u32) {
        let crc = self.payload_crc();
        let count = self.state.total_tap_count.to_le_bytes();
        self.write_fast(OFF_PAYLOAD + P_TAP_COUNT, &count);
        self.write_fast(OFF_CRC, &crc.to_le_bytes());
        let _ = self.nvm.commit();

        self.dirty = false;
        self.last_save_ms = now_ms;
    }

    /// Fast path after an ID exchange: persist one link slot, the
    /// counter when it moved, and the CRC (written last, as above).
    pub fn save_link_fast(&mut self, index: usize, now_ms: u32) {
        debug_assert!(index < MAX_LINKS);
        let crc = self.payload_crc();

        let index = index % MAX_LINKS;
        let link = self.state.links[index];
        self.write_fast(OFF_PAYLOAD + P_LINKS + index * DEVICE_UID_LEN, link.as_bytes());
        if self.link_count_changed {
            let count = self.state.link_count.to_le_bytes();
            self.write_fast(OFF_PAYLOAD + P_LINK_COUNT, &count);
        }
        self.write_fast(OFF_CRC, &crc.to_le_bytes());
        let _ = self.nvm.commit();

        self.dirty = false;
        self.link_count_changed = false;
        self.last_save_ms = now_ms;
    }

    /// Record a peer if it is not already in the table. Does not save;
    /// the caller picks the fast path. At a full table the slot wraps to
    /// the front and the counter stays put (the oldest entry is lost).
    pub fn add_link(&mut self, peer: DeviceId) -> AddLink {
        if self.has_link(&peer) {
            return AddLink::AlreadyPresent;
        }

        let mut index = self.state.link_count as usize;
        if index >= MAX_LINKS {
            index %= MAX_LINKS;
            self.link_count_changed = false;
        } else {
            self.state.link_count += 1;
            self.link_count_changed = true;
        }

        self.state.links[index] = peer;
        self.last_link_index = index;
        self.dirty = true;
        AddLink::AddedNew
    }

    pub fn has_link(&self, peer: &DeviceId) -> bool {
        self.state.link_slice().contains(peer)
    }

    pub fn increment_tap_count(&mut self) {
        self.state.total_tap_count = self.state.total_tap_count.wrapping_add(1);
        self.dirty = true;
    }

    /// Reset counters, links and the secret; `selfId` survives. A clear
    /// is a user command and is persisted immediately.
    pub fn clear_all(&mut self, now_ms: u32) {
        let self_id = self.state.self_id;
        self.state = PersistedState::default();
        self.state.self_id = self_id;
        self.dirty = true;
        if self.save_full(now_ms).is_err() {
            warn!("storage: clear save failed, will retry");
        }
    }

    /// Store the provisioned secret. Saved immediately: provisioning is
    /// rare and the key must not be lost to a power cut.
    pub fn set_secret_key(&mut self, version: u8, key: &[u8; SECRET_KEY_LEN], now_ms: u32) {
        self.state.key_version = version;
        self.state.secret_key = *key;
        self.dirty = true;
        if self.save_full(now_ms).is_err() {
            warn!("storage: key save failed, will retry");
        }
    }

    /// A nonzero version means provisioned; the key bytes themselves are
    /// not inspected, so a host may legitimately provision an all-zero
    /// secret (useful for bring-up rigs).
    pub fn has_secret_key(&self) -> bool {
        self.state.key_version != 0
    }

    pub fn secret_key(&self) -> &[u8; SECRET_KEY_LEN] {
        &self.state.secret_key
    }

    pub fn key_version(&self) -> u8 {
        self.state.key_version
    }

    pub fn state(&self) -> &PersistedState {
        &self.state
    }

    /// Slot touched by the most recent [`Store::add_link`]; feed it to
    /// [`Store::save_link_fast`].
    pub fn last_link_index(&self) -> usize {
        self.last_link_index
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn payload_crc(&self) -> u32 {
        let mut payload = [0u8; PAYLOAD_LEN];
        self.state.encode_payload(&mut payload);
        crc32_words(&payload)
    }

    fn load(&mut self) -> Option<PersistedState> {
        let mut image = [0u8; IMAGE_LEN];
        for (i, b) in image.iter_mut().enumerate() {
            *b = self.nvm.read_byte(STORAGE_BASE_ADDR + i);
        }

        let magic = u32::from_le_bytes(image[OFF_MAGIC..OFF_MAGIC + 4].try_into().unwrap());
        if magic != STORAGE_MAGIC {
            return None;
        }
        let version = u16::from_le_bytes(image[OFF_VERSION..OFF_VERSION + 2].try_into().unwrap());
        if version != STORAGE_VERSION {
            return None;
        }
        let length = u16::from_le_bytes(image[OFF_LENGTH..OFF_LENGTH + 2].try_into().unwrap());
        if length != PAYLOAD_LEN as u16 {
            return None;
        }

        let payload: &[u8; PAYLOAD_LEN] = image[OFF_PAYLOAD..].try_into().unwrap();
        let stored = u32::from_le_bytes(image[OFF_CRC..OFF_CRC + 4].try_into().unwrap());
        if crc32_words(payload) != stored {
            warn!("storage: CRC mismatch, discarding image");
            return None;
        }

        Some(PersistedState::decode_payload(payload))
    }

    /// Fast-path byte writes are assumed to succeed: the HAL commits the
    /// image region atomically and there is no retry policy to feed.
    fn write_fast(&mut self, offset: usize, bytes: &[u8]) {
        for (i, &b) in bytes.iter().enumerate() {
            let _ = self.nvm.write_byte(STORAGE_BASE_ADDR + offset + i, b);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::vec::Vec;

    const UID_A: [u8; 12] = [0xA1, 0xB2, 0xC3, 0xD4, 0xE5, 0xF6, 1, 2, 3, 4, 5, 6];

    #[derive(Default)]
    struct NvmState {
        mem: Vec<u8>,
        writes: Vec<usize>,
        commits: usize,
        fail_writes: bool,
        /// When set, writes beyond this budget are dropped on the floor
        /// (models a power cut mid-save).
        write_budget: Option<usize>,
    }

    #[derive(Clone)]
    struct MockNvm(Rc<RefCell<NvmState>>);

    impl MockNvm {
        fn blank() -> Self {
            let state = NvmState { mem: vec![0xFF; STORAGE_AREA_SIZE], ..Default::default() };
            MockNvm(Rc::new(RefCell::new(state)))
        }

        fn writes(&self) -> Vec<usize> {
            self.0.borrow().writes.clone()
        }

        fn clear_log(&self) {
            let mut s = self.0.borrow_mut();
            s.writes.clear();
            s.commits = 0;
        }

        fn commits(&self) -> usize {
            self.0.borrow().commits
        }

        fn set_fail_writes(&self, fail: bool) {
            self.0.borrow_mut().fail_writes = fail;
        }

        fn set_write_budget(&self, budget: Option<usize>) {
            self.0.borrow_mut().write_budget = budget;
        }

        fn corrupt(&self, addr: usize) {
            self.0.borrow_mut().mem[addr] ^= 0xFF;
        }
    }

    impl NvmHal for MockNvm {
        type Error = ();

        fn begin(&mut self, size: usize) -> Result<(), ()> {
            assert_eq!(size, STORAGE_AREA_SIZE);
            Ok(())
        }

        fn read_byte(&mut self, addr: usize) -> u8 {
            self.0.borrow().mem[addr]
        }

        fn write_byte(&mut self, addr: usize, value: u8) -> Result<(), ()> {
            let s = &mut *self.0.borrow_mut();
            if s.fail_writes {
                return Err(());
            }
            match s.write_budget {
                Some(0) => {} // power already lost, bits never land
                Some(ref mut n) => {
                    *n -= 1;
                    s.mem[addr] = value;
                    s.writes.push(addr);
                }
                None => {
                    s.mem[addr] = value;
                    s.writes.push(addr);
                }
            }
            Ok(())
        }

        fn commit(&mut self) -> Result<(), ()> {
            self.0.borrow_mut().commits += 1;
            Ok(())
        }

        fn delay_ms(&mut self, _ms: u32) {}
    }

    struct FixedUid([u8; 12]);

    impl UidSource for FixedUid {
        fn device_uid(&self) -> [u8; 12] {
            self.0
        }
    }

    fn fresh_store() -> (Store<MockNvm>, MockNvm) {
        let nvm = MockNvm::blank();
        let mut store = Store::new(nvm.clone());
        store.begin(&FixedUid(UID_A), 0).unwrap();
        (store, nvm)
    }

    fn peer(first: u8) -> DeviceId {
        DeviceId::new([first, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12])
    }

    #[test]
    fn fresh_boot_initializes_from_hardware_uid() {
        let (store, nvm) = fresh_store();
        assert_eq!(store.state().self_id, DeviceId::new(UID_A));
        assert_eq!(store.state().total_tap_count, 0);
        assert_eq!(store.state().link_count, 0);
        assert!(!store.has_secret_key());
        assert!(!store.is_dirty());

        // The freshly written image validates on the next boot.
        let mut second = Store::new(nvm);
        second.begin(&FixedUid([9; 12]), 0).unwrap();
        assert_eq!(second.state().self_id, DeviceId::new(UID_A));
    }

    #[test]
    fn valid_image_with_zero_self_id_gets_the_uid_stamped() {
        let (mut store, nvm) = fresh_store();
        // Forge a valid image whose selfId is zero.
        store.state.self_id = DeviceId::zero();
        store.save_full(0).unwrap();

        let mut second = Store::new(nvm);
        second.begin(&FixedUid(UID_A), 0).unwrap();
        assert_eq!(second.state().self_id, DeviceId::new(UID_A));
        assert!(!second.is_dirty());
    }

    #[test]
    fn every_save_path_survives_a_reload() {
        let (mut store, nvm) = fresh_store();

        store.increment_tap_count();
        store.save_tap_count_fast(10);
        assert_eq!(store.add_link(peer(0x51)), AddLink::AddedNew);
        store.save_link_fast(store.last_link_index(), 20);
        store.set_secret_key(2, &[0xAB; SECRET_KEY_LEN], 30);

        let mut reloaded = Store::new(nvm);
        reloaded.begin(&FixedUid([9; 12]), 0).unwrap();
        assert_eq!(reloaded.state(), store.state());
        assert_eq!(reloaded.state().total_tap_count, 1);
        assert_eq!(reloaded.state().link_count, 1);
        assert_eq!(reloaded.key_version(), 2);
    }

    #[test]
    fn add_link_is_idempotent() {
        let (mut store, _nvm) = fresh_store();
        assert_eq!(store.add_link(peer(0x51)), AddLink::AddedNew);
        assert_eq!(store.add_link(peer(0x51)), AddLink::AlreadyPresent);
        assert_eq!(store.state().link_count, 1);
        assert!(store.has_link(&peer(0x51)));
    }

    #[test]
    fn full_table_wraps_to_the_front_slot() {
        let (mut store, _nvm) = fresh_store();
        for i in 0..MAX_LINKS {
            assert_eq!(store.add_link(peer(i as u8)), AddLink::AddedNew);
        }
        assert_eq!(store.state().link_count as usize, MAX_LINKS);

        // One more unique peer overwrites slot 0; the counter stays.
        assert_eq!(store.add_link(peer(0xEE)), AddLink::AddedNew);
        assert_eq!(store.state().link_count as usize, MAX_LINKS);
        assert_eq!(store.last_link_index(), 0);
        assert_eq!(store.state().links[0], peer(0xEE));
        assert!(!store.has_link(&peer(0)));
    }

    #[test]
    fn clear_all_keeps_self_id_only() {
        let (mut store, nvm) = fresh_store();
        store.increment_tap_count();
        store.add_link(peer(0x51));
        store.set_secret_key(1, &[0x11; SECRET_KEY_LEN], 0);

        store.clear_all(100);
        assert_eq!(store.state().self_id, DeviceId::new(UID_A));
        assert_eq!(store.state().total_tap_count, 0);
        assert_eq!(store.state().link_count, 0);
        assert_eq!(store.key_version(), 0);
        assert!(!store.has_secret_key());
        assert!(store.state().links.iter().all(|l| l.is_zero()));

        // Persisted immediately and valid.
        let mut reloaded = Store::new(nvm);
        reloaded.begin(&FixedUid([9; 12]), 0).unwrap();
        assert_eq!(reloaded.state().self_id, DeviceId::new(UID_A));
        assert_eq!(reloaded.state().total_tap_count, 0);
    }

    #[test]
    fn corrupt_image_resets_on_boot() {
        let (mut store, nvm) = fresh_store();
        store.increment_tap_count();
        store.add_link(peer(0x51));
        store.save_full(0).unwrap();

        // Flip one byte inside links[0] on disk.
        nvm.corrupt(0x20);

        let mut rebooted = Store::new(nvm);
        rebooted.begin(&FixedUid([7; 12]), 0).unwrap();
        assert_eq!(rebooted.state().self_id, DeviceId::new([7; 12]));
        assert_eq!(rebooted.state().total_tap_count, 0);
        assert_eq!(rebooted.state().link_count, 0);
    }

    #[test]
    fn tap_count_fast_save_touches_eight_bytes() {
        let (mut store, nvm) = fresh_store();
        store.increment_tap_count();
        nvm.clear_log();

        store.save_tap_count_fast(5);

        let writes = nvm.writes();
        assert_eq!(writes, vec![0x18, 0x19, 0x1A, 0x1B, 0x08, 0x09, 0x0A, 0x0B]);
        assert_eq!(nvm.commits(), 1);
        assert!(!store.is_dirty());

        let mut reloaded = Store::new(nvm);
        reloaded.begin(&FixedUid([9; 12]), 0).unwrap();
        assert_eq!(reloaded.state().total_tap_count, 1);
    }

    #[test]
    fn link_fast_save_touches_slot_count_and_crc() {
        let (mut store, nvm) = fresh_store();
        store.add_link(peer(0x51));
        nvm.clear_log();

        store.save_link_fast(store.last_link_index(), 5);

        let writes = nvm.writes();
        // 12-byte slot, 2-byte counter, 4-byte CRC; CRC last.
        assert_eq!(writes.len(), 12 + 2 + 4);
        assert_eq!(&writes[..12], &(0x20..0x2C).collect::<Vec<_>>()[..]);
        assert_eq!(&writes[12..14], &[0x1C, 0x1D]);
        assert_eq!(&writes[14..], &[0x08, 0x09, 0x0A, 0x0B]);

        let mut reloaded = Store::new(nvm);
        reloaded.begin(&FixedUid([9; 12]), 0).unwrap();
        assert_eq!(reloaded.state().link_count, 1);
        assert!(reloaded.has_link(&peer(0x51)));
    }

    #[test]
    fn duplicate_link_fast_save_skips_the_counter() {
        let (mut store, nvm) = fresh_store();
        store.add_link(peer(0x51));
        store.save_link_fast(store.last_link_index(), 5);

        // Wrapped slot on a full table: counter must not be rewritten.
        for i in 1..MAX_LINKS {
            store.add_link(peer(i as u8));
        }
        store.save_full(6).unwrap();
        store.add_link(peer(0xEE));
        nvm.clear_log();
        store.save_link_fast(store.last_link_index(), 7);
        let writes = nvm.writes();
        assert_eq!(writes.len(), 12 + 4);
        assert!(!writes.contains(&0x1C));
    }

    #[test]
    fn deferred_save_waits_for_the_coalesce_window() {
        let (mut store, nvm) = fresh_store();
        store.increment_tap_count();
        nvm.clear_log();

        store.tick(10_000);
        assert_eq!(nvm.commits(), 0);
        assert!(store.is_dirty());

        store.tick(STORAGE_COALESCE_MS);
        assert_eq!(nvm.commits(), 1);
        assert!(!store.is_dirty());
    }

    #[test]
    fn failed_save_stays_dirty_and_retries() {
        let (mut store, nvm) = fresh_store();
        store.increment_tap_count();
        nvm.set_fail_writes(true);

        store.tick(STORAGE_COALESCE_MS);
        assert!(store.is_dirty());

        nvm.set_fail_writes(false);
        store.tick(2 * STORAGE_COALESCE_MS);
        assert!(!store.is_dirty());

        let mut reloaded = Store::new(nvm);
        reloaded.begin(&FixedUid([9; 12]), 0).unwrap();
        assert_eq!(reloaded.state().total_tap_count, 1);
    }

    #[test]
    fn power_cut_before_the_crc_write_invalidates_the_image() {
        let (mut store, nvm) = fresh_store();
        store.increment_tap_count();

        // Allow the tap-count bytes through, lose power before the CRC.
        nvm.set_write_budget(Some(4));
        store.save_tap_count_fast(5);
        nvm.set_write_budget(None);

        let mut rebooted = Store::new(nvm);
        rebooted.begin(&FixedUid([7; 12]), 0).unwrap();
        // Validation failed, the image was re-initialized.
        assert_eq!(rebooted.state().self_id, DeviceId::new([7; 12]));
        assert_eq!(rebooted.state().total_tap_count, 0);
    }
}
