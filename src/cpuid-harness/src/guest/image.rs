// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::mem::{offset_of, size_of};

use kvm_bindings::{kvm_cpuid_entry2, kvm_cpuid2};

use crate::cpuid::{LEAF_KVM_FEATURES, LEAF_KVM_SIGNATURE};
use crate::sync::{
    CHECK_EAX, CHECK_EBX, CHECK_ECX, CHECK_EDX, CHECK_MAX_KVM_LEAF, CMD_ABORT, CMD_DONE,
    CMD_SYNC, MAILBOX_ADDR, STAGE_ARMED, STAGE_TABLE_VERIFIED, SYNC_MAGIC, SYNC_PORT, offsets,
};

// The mismatch path indexes the expected register with `check * 4`.
const _: () = {
    assert!(offset_of!(kvm_cpuid_entry2, ebx) == offset_of!(kvm_cpuid_entry2, eax) + 4);
    assert!(offset_of!(kvm_cpuid_entry2, ecx) == offset_of!(kvm_cpuid_entry2, eax) + 8);
    assert!(offset_of!(kvm_cpuid_entry2, edx) == offset_of!(kvm_cpuid_entry2, eax) + 12);
    assert!(CHECK_EBX == CHECK_EAX + 1);
    assert!(CHECK_ECX == CHECK_EAX + 2);
    assert!(CHECK_EDX == CHECK_EAX + 3);
};

// 16-bit real-mode guest, entered at `GUEST_CODE_ADDR` with CS = DS = 0 and the address of a
// `kvm_cpuid2` table in DI. The table and the mailbox live below 64 KiB.
//
// SI: table, DI: current entry, BP: entries left.
std::arch::global_asm!(
    ".pushsection .rodata.cpuid_harness_guest,\"a\"",
    ".globl cpuid_harness_guest_start",
    ".globl cpuid_harness_guest_end",
    ".code16",
    "cpuid_harness_guest_start:",
    "    mov si, di",
    "    mov dword ptr [{mailbox} + {off_magic}], {magic}",
    "    mov dword ptr [{mailbox} + {off_stage}], {stage_armed}",
    "    mov dword ptr [{mailbox} + {off_command}], {cmd_sync}",
    "    mov dx, {port}",
    "    out dx, al",
    "    mov bp, word ptr [si + {table_nent}]",
    "    lea di, [si + {table_entries}]",
    ".Lcpuid_guest_next_entry:",
    "    test bp, bp",
    "    jz .Lcpuid_guest_table_verified",
    "    mov eax, dword ptr [di + {entry_function}]",
    "    mov ecx, dword ptr [di + {entry_index}]",
    "    cpuid",
    "    cmp eax, dword ptr [di + {entry_eax}]",
    "    jne .Lcpuid_guest_bad_eax",
    "    cmp ebx, dword ptr [di + {entry_ebx}]",
    "    jne .Lcpuid_guest_bad_ebx",
    "    cmp ecx, dword ptr [di + {entry_ecx}]",
    "    jne .Lcpuid_guest_bad_ecx",
    "    cmp edx, dword ptr [di + {entry_edx}]",
    "    jne .Lcpuid_guest_bad_edx",
    "    add di, {entry_size}",
    "    dec bp",
    "    jmp .Lcpuid_guest_next_entry",
    ".Lcpuid_guest_bad_eax:",
    "    mov dword ptr [{mailbox} + {off_actual}], eax",
    "    mov bx, {check_eax}",
    "    jmp .Lcpuid_guest_bad_register",
    ".Lcpuid_guest_bad_ebx:",
    "    mov dword ptr [{mailbox} + {off_actual}], ebx",
    "    mov bx, {check_ebx}",
    "    jmp .Lcpuid_guest_bad_register",
    ".Lcpuid_guest_bad_ecx:",
    "    mov dword ptr [{mailbox} + {off_actual}], ecx",
    "    mov bx, {check_ecx}",
    "    jmp .Lcpuid_guest_bad_register",
    ".Lcpuid_guest_bad_edx:",
    "    mov dword ptr [{mailbox} + {off_actual}], edx",
    "    mov bx, {check_edx}",
    ".Lcpuid_guest_bad_register:",
    "    movzx ebx, bx",
    "    mov dword ptr [{mailbox} + {off_check}], ebx",
    "    shl bx, 2",
    "    mov eax, dword ptr [bx + di + {entry_eax}]",
    "    mov dword ptr [{mailbox} + {off_expected}], eax",
    "    mov eax, dword ptr [di + {entry_function}]",
    "    mov dword ptr [{mailbox} + {off_function}], eax",
    "    mov eax, dword ptr [di + {entry_index}]",
    "    mov dword ptr [{mailbox} + {off_index}], eax",
    "    jmp .Lcpuid_guest_abort",
    ".Lcpuid_guest_table_verified:",
    "    mov dword ptr [{mailbox} + {off_stage}], {stage_verified}",
    "    mov dx, {port}",
    "    out dx, al",
    "    mov eax, {kvm_signature}",
    "    xor ecx, ecx",
    "    cpuid",
    "    cmp eax, {kvm_features}",
    "    jne .Lcpuid_guest_bad_max_leaf",
    "    mov dword ptr [{mailbox} + {off_command}], {cmd_done}",
    "    mov dx, {port}",
    "    out dx, al",
    ".Lcpuid_guest_halt:",
    "    hlt",
    "    jmp .Lcpuid_guest_halt",
    ".Lcpuid_guest_bad_max_leaf:",
    "    mov dword ptr [{mailbox} + {off_actual}], eax",
    "    mov dword ptr [{mailbox} + {off_expected}], {kvm_features}",
    "    mov dword ptr [{mailbox} + {off_function}], {kvm_signature}",
    "    mov dword ptr [{mailbox} + {off_index}], 0",
    "    mov dword ptr [{mailbox} + {off_check}], {check_max_leaf}",
    ".Lcpuid_guest_abort:",
    "    mov dword ptr [{mailbox} + {off_command}], {cmd_abort}",
    "    mov dx, {port}",
    "    out dx, al",
    "    jmp .Lcpuid_guest_halt",
    "cpuid_harness_guest_end:",
    ".code64",
    ".popsection",
    mailbox = const MAILBOX_ADDR,
    port = const SYNC_PORT,
    magic = const SYNC_MAGIC,
    cmd_sync = const CMD_SYNC,
    cmd_done = const CMD_DONE,
    cmd_abort = const CMD_ABORT,
    stage_armed = const STAGE_ARMED,
    stage_verified = const STAGE_TABLE_VERIFIED,
    check_eax = const CHECK_EAX,
    check_ebx = const CHECK_EBX,
    check_ecx = const CHECK_ECX,
    check_edx = const CHECK_EDX,
    check_max_leaf = const CHECK_MAX_KVM_LEAF,
    kvm_signature = const LEAF_KVM_SIGNATURE,
    kvm_features = const LEAF_KVM_FEATURES,
    off_magic = const offsets::MAGIC,
    off_command = const offsets::COMMAND,
    off_stage = const offsets::STAGE,
    off_function = const offsets::FUNCTION,
    off_index = const offsets::INDEX,
    off_check = const offsets::CHECK,
    off_expected = const offsets::EXPECTED,
    off_actual = const offsets::ACTUAL,
    table_nent = const offset_of!(kvm_cpuid2, nent),
    table_entries = const offset_of!(kvm_cpuid2, entries),
    entry_function = const offset_of!(kvm_cpuid_entry2, function),
    entry_index = const offset_of!(kvm_cpuid_entry2, index),
    entry_eax = const offset_of!(kvm_cpuid_entry2, eax),
    entry_ebx = const offset_of!(kvm_cpuid_entry2, ebx),
    entry_ecx = const offset_of!(kvm_cpuid_entry2, ecx),
    entry_edx = const offset_of!(kvm_cpuid_entry2, edx),
    entry_size = const size_of::<kvm_cpuid_entry2>(),
);

unsafe extern "C" {
    static cpuid_harness_guest_start: u8;
    static cpuid_harness_guest_end: u8;
}

/// Machine code of the real-mode verifier, to be copied to [`super::GUEST_CODE_ADDR`].
#[must_use]
pub fn guest_code() -> &'static [u8] {
    // SAFETY: Both symbols are defined by the `global_asm!` block above and delimit a single
    // read-only section that lives for the whole program.
    unsafe {
        let start = &raw const cpuid_harness_guest_start;
        let end = &raw const cpuid_harness_guest_end;
        std::slice::from_raw_parts(start, end.addr() - start.addr())
    }
}
